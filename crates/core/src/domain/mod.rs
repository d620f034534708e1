// Domain Layer - Transactions, events and the question protocol

pub mod error;
pub mod event;
pub mod failure;
pub mod package;
pub mod question;
pub mod transaction;

// Re-exports
pub use error::DomainError;
pub use event::{EventPayload, Outcome, PhaseCode, ProgressDetail, ProgressUpdate, TransactionEvent};
pub use failure::{ErrorCategory, TransactionError};
pub use package::{PackageMode, PackageSet};
pub use question::{Answer, Question};
pub use transaction::{
    Phase, SessionId, Transaction, TransactionId, TransactionKind, TransactionState,
    TransactionView,
};
