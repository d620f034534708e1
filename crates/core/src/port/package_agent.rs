// Package Agent Port
// The privileged process that actually mutates the package database

use crate::domain::{Answer, PackageSet, PhaseCode, Question, TransactionError};
use async_trait::async_trait;
use thiserror::Error;

/// Failure to reach or instruct the agent (not a transaction failure)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Agent transport error: {0}")]
    Transport(String),
}

/// Commands the core sends to the privileged agent.
///
/// Every call only *begins* work. Results come back asynchronously as
/// [`AgentNotice`]s through the sink handed to the adapter.
#[async_trait]
pub trait PackageAgent: Send + Sync {
    /// Begin installing/removing/upgrading `packages`
    async fn commit_changes(&self, packages: &PackageSet) -> Result<(), AgentError>;

    /// Begin refreshing package metadata
    async fn update_cache(&self) -> Result<(), AgentError>;

    /// Best-effort cancel of the current download phase
    async fn cancel_download(&self) -> Result<(), AgentError>;

    /// Answer the single outstanding question
    async fn answer_question(&self, answer: &Answer) -> Result<(), AgentError>;
}

/// Typed signal emitted by the agent during execution
#[derive(Debug, Clone, PartialEq)]
pub enum AgentSignal {
    WorkerStarted,
    WorkerEvent(PhaseCode),
    DownloadProgress {
        percent: u8,
        speed_bytes_per_sec: Option<u64>,
        eta_seconds: Option<u64>,
    },
    CommitProgress {
        message: String,
        percent: u8,
    },
    QuestionOccurred(Question),
    ErrorOccurred(TransactionError),
    WorkerFinished {
        success: bool,
    },
}

/// Everything an agent adapter reports back to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum AgentNotice {
    Signal(AgentSignal),
    /// Bus-level owner change of the agent service. An empty
    /// `new_owner` means the agent is gone.
    OwnerChanged {
        old_owner: String,
        new_owner: String,
    },
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Call recorded by [`MockPackageAgent`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum AgentCall {
        CommitChanges(PackageSet),
        UpdateCache,
        CancelDownload,
        AnswerQuestion(Answer),
    }

    /// Mock agent that records calls and can refuse dispatch
    #[derive(Default)]
    pub struct MockPackageAgent {
        calls: Arc<Mutex<Vec<AgentCall>>>,
        refuse_dispatch: Arc<Mutex<Option<AgentError>>>,
    }

    impl MockPackageAgent {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every following commit/update call fail with `error`
        pub fn refuse_dispatch(&self, error: AgentError) {
            *self.refuse_dispatch.lock().unwrap() = Some(error);
        }

        pub fn calls(&self) -> Vec<AgentCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn dispatch_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, AgentCall::CommitChanges(_) | AgentCall::UpdateCache))
                .count()
        }

        fn record(&self, call: AgentCall) {
            self.calls.lock().unwrap().push(call);
        }

        fn dispatch(&self, call: AgentCall) -> Result<(), AgentError> {
            if let Some(err) = self.refuse_dispatch.lock().unwrap().clone() {
                return Err(err);
            }
            self.record(call);
            Ok(())
        }
    }

    #[async_trait]
    impl PackageAgent for MockPackageAgent {
        async fn commit_changes(&self, packages: &PackageSet) -> Result<(), AgentError> {
            self.dispatch(AgentCall::CommitChanges(packages.clone()))
        }
        async fn update_cache(&self) -> Result<(), AgentError> {
            self.dispatch(AgentCall::UpdateCache)
        }
        async fn cancel_download(&self) -> Result<(), AgentError> {
            self.record(AgentCall::CancelDownload);
            Ok(())
        }
        async fn answer_question(&self, answer: &Answer) -> Result<(), AgentError> {
            self.record(AgentCall::AnswerQuestion(*answer));
            Ok(())
        }
    }
}
