// Scheduler command channel
// Clients and the agent adapter share one inbox, so every mutation is
// applied by the reactor in arrival order.

use super::outcome::{AnswerOutcome, CancelOutcome};
use crate::application::event_channel::EventStream;
use crate::application::queue::{EnqueueOutcome, QueueSnapshot};
use crate::domain::{Answer, PackageSet, SessionId, Transaction, TransactionId, TransactionKind};
use crate::error::{AppError, Result};
use crate::port::AgentNotice;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

pub(crate) enum Command {
    OpenSession {
        reply: oneshot::Sender<SessionId>,
    },
    CloseSession {
        session_id: SessionId,
    },
    Create {
        session_id: SessionId,
        kind: TransactionKind,
        packages: PackageSet,
        reply: oneshot::Sender<Result<TransactionId>>,
    },
    Enqueue {
        session_id: SessionId,
        id: TransactionId,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    Remove {
        session_id: SessionId,
        id: TransactionId,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        session_id: SessionId,
        id: TransactionId,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Answer {
        session_id: SessionId,
        id: TransactionId,
        answer: Answer,
        reply: oneshot::Sender<AnswerOutcome>,
    },
    Subscribe {
        id: TransactionId,
        reply: oneshot::Sender<Result<EventStream>>,
    },
    WatchQueue {
        reply: oneshot::Sender<(QueueSnapshot, broadcast::Receiver<QueueSnapshot>)>,
    },
    Transactions {
        reply: oneshot::Sender<Vec<Transaction>>,
    },
    List {
        reply: oneshot::Sender<QueueListing>,
    },
    Get {
        id: TransactionId,
        reply: oneshot::Sender<Option<Transaction>>,
    },
    Agent(AgentNotice),
}

/// Queue structure and the live transactions it names, taken together
#[derive(Debug, Clone)]
pub struct QueueListing {
    pub snapshot: QueueSnapshot,
    /// Active first
    pub transactions: Vec<Transaction>,
}

/// Client-side handle to the scheduler reactor. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

/// Where the agent adapter reports signals and presence changes
#[derive(Clone)]
pub struct AgentSink {
    tx: mpsc::UnboundedSender<Command>,
}

/// Receiving end, consumed by [`super::Scheduler::new`]
pub struct SchedulerInbox {
    pub(crate) rx: mpsc::UnboundedReceiver<Command>,
}

/// Create the command channel shared by clients and the agent adapter
pub fn channel() -> (SchedulerHandle, AgentSink, SchedulerInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SchedulerHandle { tx: tx.clone() },
        AgentSink { tx },
        SchedulerInbox { rx },
    )
}

impl AgentSink {
    /// Returns false if the scheduler is gone
    pub fn notify(&self, notice: AgentNotice) -> bool {
        self.tx.send(Command::Agent(notice)).is_ok()
    }
}

impl SchedulerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| AppError::SchedulerStopped)?;
        rx.await.map_err(|_| AppError::SchedulerStopped)
    }

    pub async fn open_session(&self) -> Result<SessionId> {
        self.request(|reply| Command::OpenSession { reply }).await
    }

    /// Fire-and-forget; safe to call from `Drop`
    pub fn close_session(&self, session_id: &str) {
        let sent = self.tx.send(Command::CloseSession {
            session_id: session_id.to_string(),
        });
        if sent.is_err() {
            debug!(session_id = %session_id, "Session close after scheduler stopped");
        }
    }

    /// Propose a transaction. It does not run until enqueued.
    pub async fn create(
        &self,
        session_id: &str,
        kind: TransactionKind,
        packages: PackageSet,
    ) -> Result<TransactionId> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::Create {
            session_id,
            kind,
            packages,
            reply,
        })
        .await?
    }

    pub async fn enqueue(&self, session_id: &str, id: &str) -> Result<EnqueueOutcome> {
        let (session_id, id) = (session_id.to_string(), id.to_string());
        self.request(|reply| Command::Enqueue {
            session_id,
            id,
            reply,
        })
        .await
    }

    /// Withdraw a proposed or queued transaction. True if it was removed.
    pub async fn remove(&self, session_id: &str, id: &str) -> Result<bool> {
        let (session_id, id) = (session_id.to_string(), id.to_string());
        self.request(|reply| Command::Remove {
            session_id,
            id,
            reply,
        })
        .await
    }

    pub async fn cancel(&self, session_id: &str, id: &str) -> Result<CancelOutcome> {
        let (session_id, id) = (session_id.to_string(), id.to_string());
        self.request(|reply| Command::Cancel {
            session_id,
            id,
            reply,
        })
        .await
    }

    pub async fn answer(&self, session_id: &str, id: &str, answer: Answer) -> Result<AnswerOutcome> {
        let (session_id, id) = (session_id.to_string(), id.to_string());
        self.request(|reply| Command::Answer {
            session_id,
            id,
            answer,
            reply,
        })
        .await
    }

    /// Ordered event stream for `id`, replayed from its first event.
    ///
    /// Fails with `NotFound` for a finished transaction whose events are
    /// no longer retained.
    pub async fn subscribe(&self, id: &str) -> Result<EventStream> {
        let id = id.to_string();
        self.request(|reply| Command::Subscribe { id, reply }).await?
    }

    /// Current queue plus a receiver for every later change
    pub async fn watch_queue(&self) -> Result<(QueueSnapshot, broadcast::Receiver<QueueSnapshot>)> {
        self.request(|reply| Command::WatchQueue { reply }).await
    }

    /// Live transactions, Active first
    pub async fn transactions(&self) -> Result<Vec<Transaction>> {
        self.request(|reply| Command::Transactions { reply }).await
    }

    /// Snapshot and live transactions from the same reactor turn
    pub async fn list(&self) -> Result<QueueListing> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn active_transaction(&self) -> Result<Option<Transaction>> {
        let all = self.transactions().await?;
        Ok(all
            .into_iter()
            .find(|t| t.state == crate::domain::TransactionState::Active))
    }

    /// Live or recently finished transaction
    pub async fn transaction(&self, id: &str) -> Result<Option<Transaction>> {
        let id = id.to_string();
        self.request(|reply| Command::Get { id, reply }).await
    }
}
