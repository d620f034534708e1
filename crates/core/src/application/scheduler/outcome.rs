// Results of client requests that are not errors

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    Cancelled,
    /// Commit phase has begun
    TooLate,
    /// Handed to the agent, phase not yet known
    NotCancellable,
    NotOwner,
    AlreadyFinished,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnswerOutcome {
    /// Forwarded; the transaction continues
    Accepted,
    /// Forwarded; the transaction was cancelled
    Declined,
    /// No matching outstanding question
    Ignored,
}
