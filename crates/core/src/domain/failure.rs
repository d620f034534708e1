// Transaction Failure Kinds

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error that terminates a transaction.
///
/// Every variant carries its own structured arguments; the core only
/// classifies and routes these, it never renders them for humans.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionError {
    #[error("package system could not be initialized")]
    Init,

    #[error("package system lock is held by another writer")]
    Lock,

    #[error("not enough disk space in {directory}")]
    DiskSpace { directory: String },

    #[error("failed to download {failed_item}: {error_text}")]
    Fetch {
        failed_item: String,
        error_text: String,
    },

    #[error("failed to commit {failed_item}: {error_text}")]
    Commit {
        failed_item: String,
        error_text: String,
    },

    #[error("authorization was not granted")]
    Auth,

    #[error("untrusted packages: {}", .untrusted_items.join(", "))]
    Untrusted { untrusted_items: Vec<String> },

    #[error("privileged agent disappeared")]
    AgentLost,

    #[error("unknown agent error (code {code})")]
    Unknown { code: i32 },
}

/// One user-facing category per error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Initialization,
    Lock,
    DiskSpace,
    Download,
    Commit,
    Authentication,
    Untrusted,
    UnexpectedTermination,
    Unknown,
}

impl TransactionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransactionError::Init => ErrorCategory::Initialization,
            TransactionError::Lock => ErrorCategory::Lock,
            TransactionError::DiskSpace { .. } => ErrorCategory::DiskSpace,
            TransactionError::Fetch { .. } => ErrorCategory::Download,
            TransactionError::Commit { .. } => ErrorCategory::Commit,
            TransactionError::Auth => ErrorCategory::Authentication,
            TransactionError::Untrusted { .. } => ErrorCategory::Untrusted,
            TransactionError::AgentLost => ErrorCategory::UnexpectedTermination,
            TransactionError::Unknown { .. } => ErrorCategory::Unknown,
        }
    }

    /// Systemic errors fail the whole remaining queue, not just one transaction
    pub fn is_systemic(&self) -> bool {
        matches!(self, TransactionError::AgentLost)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Initialization => "Initialization error",
            ErrorCategory::Lock => "Unable to obtain package system lock",
            ErrorCategory::DiskSpace => "Low disk space",
            ErrorCategory::Download => "Download failed",
            ErrorCategory::Commit => "Commit error",
            ErrorCategory::Authentication => "Authentication error",
            ErrorCategory::Untrusted => "Untrusted packages",
            ErrorCategory::UnexpectedTermination => "Unexpected error",
            ErrorCategory::Unknown => "Unknown error",
        };
        f.write_str(s)
    }
}
