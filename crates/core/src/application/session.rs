// Client Sessions

use crate::application::event_channel::EventStream;
use crate::application::queue::EnqueueOutcome;
use crate::application::scheduler::{AnswerOutcome, CancelOutcome, SchedulerHandle};
use crate::domain::{Answer, PackageSet, SessionId, TransactionId, TransactionKind};
use crate::error::Result;
use std::collections::HashMap;

/// Open sessions, as seen by the scheduler
#[derive(Default)]
pub struct SessionRegistry {
    opened_at: HashMap<SessionId, i64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if already open
    pub fn open(&mut self, session_id: &str, now_millis: i64) -> bool {
        if self.opened_at.contains_key(session_id) {
            return false;
        }
        self.opened_at.insert(session_id.to_string(), now_millis);
        true
    }

    /// Returns false if the session was not open
    pub fn close(&mut self, session_id: &str) -> bool {
        self.opened_at.remove(session_id).is_some()
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.opened_at.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.opened_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opened_at.is_empty()
    }
}

/// One client's view of the scheduler.
///
/// Owns its transactions for cancel/answer purposes. Dropping the session
/// tears it down: unconfirmed transactions are discarded and a question
/// it was expected to answer is declined.
pub struct ClientSession {
    handle: SchedulerHandle,
    session_id: SessionId,
}

impl ClientSession {
    pub async fn open(handle: SchedulerHandle) -> Result<Self> {
        let session_id = handle.open_session().await?;
        Ok(Self { handle, session_id })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Create an unconfirmed transaction
    pub async fn propose(&self, kind: TransactionKind, packages: PackageSet) -> Result<TransactionId> {
        self.handle.create(&self.session_id, kind, packages).await
    }

    pub async fn enqueue(&self, id: &str) -> Result<EnqueueOutcome> {
        self.handle.enqueue(&self.session_id, id).await
    }

    /// Propose and immediately enqueue
    pub async fn submit(&self, kind: TransactionKind, packages: PackageSet) -> Result<TransactionId> {
        let id = self.propose(kind, packages).await?;
        self.enqueue(&id).await?;
        Ok(id)
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.handle.remove(&self.session_id, id).await
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        self.handle.cancel(&self.session_id, id).await
    }

    pub async fn answer(&self, id: &str, answer: Answer) -> Result<AnswerOutcome> {
        self.handle.answer(&self.session_id, id, answer).await
    }

    pub async fn subscribe(&self, id: &str) -> Result<EventStream> {
        self.handle.subscribe(id).await
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.handle.close_session(&self.session_id);
    }
}
