//! pkgtxn SDK - Rust Client Library
//!
//! Client for the pkgtxn daemon's JSON-RPC interface.
//!
//! # Example
//!
//! ```no_run
//! use pkgtxn_sdk::PkgTxnClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = PkgTxnClient::connect("ws://127.0.0.1:9631").await?;
//!
//!     for txn in client.history(10).await? {
//!         println!("{} {:?} {:?}", txn.id, txn.kind, txn.state);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod types;

pub use client::PkgTxnClient;
pub use error::{Result, SdkError};
pub use jsonrpsee::core::client::Subscription;
pub use types::{
    AnswerResponse, CancelResponse, CreateResponse, EnqueueResponse, QueueListResponse,
    RemoveResponse,
};
