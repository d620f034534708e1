//! JSON-RPC API Layer
//!
//! Exposes client sessions, transactions and their event streams over
//! JSON-RPC 2.0 (HTTP and WebSocket on one localhost port).

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use server::{RpcServer, RpcServerConfig};
