// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid transaction state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Duplicate transaction id: {0}")]
    DuplicateTransaction(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
