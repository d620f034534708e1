// Transaction Event Model

use crate::domain::failure::TransactionError;
use crate::domain::question::Question;
use crate::domain::transaction::{Phase, TransactionId};
use serde::{Deserialize, Serialize};

/// One message on a transaction's event stream.
///
/// `sequence` starts at 0 for every transaction and increases by one per
/// event, so subscribers can verify they saw the stream in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: TransactionId,
    pub sequence: u64,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    Started,
    Progress(ProgressUpdate),
    Question(Question),
    Error(TransactionError),
    Finished(Outcome),
}

impl EventPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::Finished(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub percent: u8,
    pub detail: ProgressDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressDetail {
    PhaseChanged {
        code: PhaseCode,
    },
    Download {
        speed_bytes_per_sec: Option<u64>,
        eta_seconds: Option<u64>,
    },
    Commit {
        message: String,
    },
}

/// Phase transition reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseCode {
    CacheUpdateStarted,
    CacheUpdateFinished,
    PackageDownloadStarted,
    PackageDownloadFinished,
    CommitChangesStarted,
    CommitChangesFinished,
}

impl PhaseCode {
    /// Sub-phase this code belongs to. Cache refresh is a download.
    pub fn phase(&self) -> Phase {
        match self {
            PhaseCode::CacheUpdateStarted
            | PhaseCode::CacheUpdateFinished
            | PhaseCode::PackageDownloadStarted
            | PhaseCode::PackageDownloadFinished => Phase::Downloading,
            PhaseCode::CommitChangesStarted | PhaseCode::CommitChangesFinished => {
                Phase::Committing
            }
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(
            self,
            PhaseCode::CacheUpdateFinished
                | PhaseCode::PackageDownloadFinished
                | PhaseCode::CommitChangesFinished
        )
    }
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}
