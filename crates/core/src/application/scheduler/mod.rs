// Scheduler - single-writer reactor over the transaction queue

pub mod constants;
mod handle;
mod outcome;
mod shutdown;

pub use handle::{channel, AgentSink, QueueListing, SchedulerHandle, SchedulerInbox};
pub use outcome::{AnswerOutcome, CancelOutcome};
pub use shutdown::{shutdown_channel, ShutdownListener, ShutdownTrigger};

use crate::application::event_channel::{EventChannel, EventStream};
use crate::application::queue::{EnqueueOutcome, Resolution, TransactionQueue};
use crate::application::session::SessionRegistry;
use crate::domain::{
    Answer, EventPayload, Outcome, PackageSet, Phase, ProgressDetail, ProgressUpdate, Question,
    Transaction, TransactionError, TransactionId, TransactionKind, TransactionState,
};
use crate::error::{AppError, Result};
use crate::port::{AgentNotice, AgentSignal, IdProvider, PackageAgent, TimeProvider, TransactionStore};
use constants::*;
use handle::Command;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Closed event streams kept for late subscribers
    pub retained_streams: usize,
    /// Queue-changed notifications buffered per watcher
    pub queue_notify_capacity: usize,
    /// Finished transactions kept in memory for lookups
    pub retired_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retained_streams: DEFAULT_RETAINED_STREAMS,
            queue_notify_capacity: DEFAULT_QUEUE_NOTIFY_CAPACITY,
            retired_capacity: DEFAULT_RETIRED_CAPACITY,
        }
    }
}

/// What the agent is currently working on
#[derive(Debug, Clone, PartialEq, Eq)]
enum AgentSlot {
    Idle,
    /// Dispatched; stays busy until the agent reports it finished,
    /// even if the transaction was already retired
    Busy(TransactionId),
}

/// Owns the queue, the event log and the session table.
///
/// Nothing else mutates them: clients and the agent adapter send
/// commands through [`channel`] and the reactor applies them one by one.
pub struct Scheduler {
    inbox: SchedulerInbox,
    queue: TransactionQueue,
    events: EventChannel,
    sessions: SessionRegistry,
    agent_slot: AgentSlot,
    agent: Arc<dyn PackageAgent>,
    store: Arc<dyn TransactionStore>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl Scheduler {
    pub fn new(
        inbox: SchedulerInbox,
        config: SchedulerConfig,
        agent: Arc<dyn PackageAgent>,
        store: Arc<dyn TransactionStore>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            inbox,
            queue: TransactionQueue::new(config.retired_capacity, config.queue_notify_capacity),
            events: EventChannel::new(config.retained_streams),
            sessions: SessionRegistry::new(),
            agent_slot: AgentSlot::Idle,
            agent,
            store,
            id_provider,
            time_provider,
        }
    }

    /// Run until shutdown is triggered or every handle is dropped
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> Result<()> {
        info!("Scheduler started");
        loop {
            if shutdown.is_triggered() {
                break;
            }
            tokio::select! {
                _ = shutdown.triggered() => {
                    info!("Scheduler interrupted by shutdown");
                    break;
                }
                command = self.inbox.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        info!("All scheduler handles dropped");
                        break;
                    }
                }
            }
        }

        if let Some(active) = self.queue.active_transaction() {
            // Left non-terminal in the store; recovery fails it on next start
            warn!(transaction_id = %active.id, "Scheduler stopped with an active transaction");
        }
        info!("Scheduler stopped");
        Ok(())
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::OpenSession { reply } => {
                let session_id = format!("session-{}", self.id_provider.generate_id());
                self.sessions.open(&session_id, self.time_provider.now_millis());
                info!(session_id = %session_id, "Session opened");
                let _ = reply.send(session_id);
            }
            Command::CloseSession { session_id } => self.close_session(&session_id).await,
            Command::Create {
                session_id,
                kind,
                packages,
                reply,
            } => {
                let result = self.create(&session_id, kind, packages).await;
                let _ = reply.send(result);
            }
            Command::Enqueue {
                session_id,
                id,
                reply,
            } => {
                let outcome = self.enqueue(&session_id, &id).await;
                let _ = reply.send(outcome);
            }
            Command::Remove {
                session_id,
                id,
                reply,
            } => {
                let removed = self.remove(&session_id, &id).await;
                let _ = reply.send(removed);
            }
            Command::Cancel {
                session_id,
                id,
                reply,
            } => {
                let outcome = self.cancel(&session_id, &id).await;
                let _ = reply.send(outcome);
            }
            Command::Answer {
                session_id,
                id,
                answer,
                reply,
            } => {
                let outcome = self.answer(&session_id, &id, answer).await;
                let _ = reply.send(outcome);
            }
            Command::Subscribe { id, reply } => {
                let result = self.subscribe(&id).await;
                let _ = reply.send(result);
            }
            Command::WatchQueue { reply } => {
                let _ = reply.send((self.queue.snapshot(), self.queue.subscribe_changes()));
            }
            Command::Transactions { reply } => {
                let all = self.queue.transactions().into_iter().cloned().collect();
                let _ = reply.send(all);
            }
            Command::List { reply } => {
                let listing = QueueListing {
                    snapshot: self.queue.snapshot(),
                    transactions: self.queue.transactions().into_iter().cloned().collect(),
                };
                let _ = reply.send(listing);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.queue.lookup(&id).cloned());
            }
            Command::Agent(AgentNotice::Signal(signal)) => self.on_signal(signal).await,
            Command::Agent(AgentNotice::OwnerChanged {
                old_owner,
                new_owner,
            }) => self.on_owner_changed(&old_owner, &new_owner).await,
        }
        debug_assert!(self.queue.invariants_hold());
    }

    // ------------------------------------------------------------------
    // Client requests
    // ------------------------------------------------------------------

    async fn create(
        &mut self,
        session_id: &str,
        kind: TransactionKind,
        packages: PackageSet,
    ) -> Result<TransactionId> {
        if !self.sessions.is_open(session_id) {
            return Err(AppError::NotFound(format!("session {}", session_id)));
        }

        let txn = Transaction::new(
            self.id_provider.generate_id(),
            self.time_provider.now_millis(),
            session_id,
            kind,
            packages,
        )?;
        let id = self.queue.add_pending(txn.clone())?;
        info!(transaction_id = %id, session_id = %session_id, kind = %kind, "Transaction created");
        self.persist(&txn).await;
        Ok(id)
    }

    async fn enqueue(&mut self, session_id: &str, id: &str) -> EnqueueOutcome {
        if !self.owned_by(id, session_id) {
            warn!(transaction_id = %id, session_id = %session_id, "Enqueue from non-owner ignored");
            return EnqueueOutcome::Ignored;
        }

        let outcome = self.queue.enqueue(id, self.time_provider.now_millis());
        if outcome == EnqueueOutcome::Ignored {
            return outcome;
        }
        self.persist_live(id).await;
        if outcome == EnqueueOutcome::Activated {
            self.dispatch_if_ready().await;
        }
        outcome
    }

    async fn remove(&mut self, session_id: &str, id: &str) -> bool {
        if !self.owned_by(id, session_id) {
            warn!(transaction_id = %id, session_id = %session_id, "Remove from non-owner ignored");
            return false;
        }
        self.withdraw(id).await
    }

    async fn cancel(&mut self, session_id: &str, id: &str) -> CancelOutcome {
        let Some(txn) = self.queue.lookup(id) else {
            return CancelOutcome::Unknown;
        };
        if txn.owner != session_id {
            warn!(transaction_id = %id, session_id = %session_id, "Cancel from non-owner rejected");
            return CancelOutcome::NotOwner;
        }
        if txn.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }

        let stranded_question = txn.pending_question.as_ref().map(Question::decline);

        match (txn.state, txn.phase) {
            (TransactionState::Proposed | TransactionState::Pending, _) => {
                if self.withdraw(id).await {
                    CancelOutcome::Cancelled
                } else {
                    CancelOutcome::Unknown
                }
            }
            (TransactionState::Active, Some(Phase::Waiting)) => {
                self.conclude_active(Resolution::Cancelled).await;
                self.advance().await;
                CancelOutcome::Cancelled
            }
            (TransactionState::Active, Some(Phase::Downloading)) => {
                // The agent blocks on an open question until it is answered
                if let Some(decline) = stranded_question {
                    if let Err(e) = self.agent.answer_question(&decline).await {
                        error!(transaction_id = %id, error = %e, "Failed to forward declining answer");
                    }
                }
                if let Err(e) = self.agent.cancel_download().await {
                    error!(transaction_id = %id, error = %e, "Failed to cancel download");
                }
                self.conclude_active(Resolution::Cancelled).await;
                self.advance().await;
                CancelOutcome::Cancelled
            }
            (TransactionState::Active, Some(Phase::Committing)) => {
                info!(transaction_id = %id, "Cancel rejected: commit in progress");
                CancelOutcome::TooLate
            }
            _ => CancelOutcome::NotCancellable,
        }
    }

    async fn answer(&mut self, session_id: &str, id: &str, answer: Answer) -> AnswerOutcome {
        let Some(txn) = self.queue.active_transaction().filter(|t| t.id == id) else {
            debug!(transaction_id = %id, "Answer for non-active transaction ignored");
            return AnswerOutcome::Ignored;
        };
        if txn.owner != session_id {
            warn!(transaction_id = %id, session_id = %session_id, "Answer from non-owner ignored");
            return AnswerOutcome::Ignored;
        }
        let Some(question) = txn.pending_question.as_ref() else {
            debug!(transaction_id = %id, "Answer without outstanding question ignored");
            return AnswerOutcome::Ignored;
        };
        if !answer.answers(question) {
            warn!(transaction_id = %id, ?answer, "Answer does not match question, ignored");
            return AnswerOutcome::Ignored;
        }

        if answer.proceeds() {
            if let Err(e) = self.agent.answer_question(&answer).await {
                error!(transaction_id = %id, error = %e, "Failed to forward answer");
                return AnswerOutcome::Ignored;
            }
            if let Some(txn) = self.queue.active_mut() {
                txn.pending_question = None;
            }
            info!(transaction_id = %id, "Question answered");
            AnswerOutcome::Accepted
        } else {
            self.decline_and_cancel(answer).await;
            AnswerOutcome::Declined
        }
    }

    async fn subscribe(&mut self, id: &str) -> Result<EventStream> {
        if !self.events.has_stream(id) && self.is_finished(id).await {
            debug!(transaction_id = %id, "Subscribe after event history expired");
            return Err(AppError::NotFound(format!(
                "events of finished transaction {} are no longer retained",
                id
            )));
        }
        Ok(self.events.subscribe(id))
    }

    async fn close_session(&mut self, session_id: &str) {
        if !self.sessions.close(session_id) {
            debug!(session_id = %session_id, "Close for unknown session");
            return;
        }
        info!(session_id = %session_id, "Session closed");

        for id in self.queue.proposed_by(session_id) {
            self.withdraw(&id).await;
        }

        let stranded_question = self
            .queue
            .active_transaction()
            .filter(|t| t.owner == session_id)
            .and_then(|t| t.pending_question.as_ref())
            .map(Question::decline);
        if let Some(decline) = stranded_question {
            warn!(session_id = %session_id, "Owner left with a question outstanding");
            self.decline_and_cancel(decline).await;
        }
    }

    // ------------------------------------------------------------------
    // Agent notices
    // ------------------------------------------------------------------

    async fn on_signal(&mut self, signal: AgentSignal) {
        if let AgentSignal::WorkerFinished { success } = signal {
            return self.on_worker_finished(success).await;
        }

        let Some(id) = self.live_target() else {
            debug!(?signal, "Signal without live transaction dropped");
            return;
        };

        match signal {
            AgentSignal::WorkerStarted => {
                info!(transaction_id = %id, "Agent started transaction");
                self.events.publish(&id, EventPayload::Started);
            }
            AgentSignal::WorkerEvent(code) => {
                let Some(txn) = self.queue.active_mut() else {
                    return;
                };
                if let Err(e) = txn.enter_phase(code.phase()) {
                    warn!(transaction_id = %id, error = %e, "Phase change rejected");
                    return;
                }
                if code.is_finish() {
                    let _ = txn.record_progress(100);
                }
                let update = ProgressUpdate {
                    phase: code.phase(),
                    percent: txn.progress_percent,
                    detail: ProgressDetail::PhaseChanged { code },
                };
                debug!(transaction_id = %id, ?code, "Phase event");
                self.events.publish(&id, EventPayload::Progress(update));
            }
            AgentSignal::DownloadProgress {
                percent,
                speed_bytes_per_sec,
                eta_seconds,
            } => {
                let Some(update) = self.record_progress(
                    Phase::Downloading,
                    percent,
                    ProgressDetail::Download {
                        speed_bytes_per_sec,
                        eta_seconds,
                    },
                ) else {
                    return;
                };
                self.events.publish(&id, EventPayload::Progress(update));
            }
            AgentSignal::CommitProgress { message, percent } => {
                if let Some(txn) = self.queue.active_mut() {
                    let _ = txn.enter_phase(Phase::Committing);
                    txn.status_message = Some(message.clone());
                }
                let Some(update) = self.record_progress(
                    Phase::Committing,
                    percent,
                    ProgressDetail::Commit { message },
                ) else {
                    return;
                };
                self.events.publish(&id, EventPayload::Progress(update));
            }
            AgentSignal::QuestionOccurred(question) => self.on_question(&id, question).await,
            AgentSignal::ErrorOccurred(err) => {
                error!(transaction_id = %id, error = %err, "Transaction failed");
                let systemic = err.is_systemic();
                self.conclude_active(Resolution::Failed(err.clone())).await;
                if systemic {
                    self.flush_queue(err).await;
                }
                self.advance().await;
            }
            AgentSignal::WorkerFinished { .. } => {}
        }
    }

    async fn on_question(&mut self, id: &str, question: Question) {
        let owner_present = self
            .queue
            .active_transaction()
            .is_some_and(|t| self.sessions.is_open(&t.owner));

        if !owner_present {
            warn!(transaction_id = %id, "Question for a departed owner, declining");
            self.decline_and_cancel(question.decline()).await;
            return;
        }

        if let Some(txn) = self.queue.active_mut() {
            if txn.pending_question.is_some() {
                warn!(transaction_id = %id, "Question replaced an unanswered one");
            }
            txn.pending_question = Some(question.clone());
        }
        info!(transaction_id = %id, ?question, "Waiting for answer");
        self.events.publish(id, EventPayload::Question(question));
    }

    async fn on_worker_finished(&mut self, success: bool) {
        let target = self.live_target();
        self.agent_slot = AgentSlot::Idle;

        match target {
            Some(id) if success => {
                info!(transaction_id = %id, "Transaction finished");
                self.conclude_active(Resolution::Finished).await;
            }
            Some(id) => {
                error!(transaction_id = %id, "Agent finished unsuccessfully without an error");
                let err = TransactionError::Unknown {
                    code: UNREPORTED_FAILURE_CODE,
                };
                self.conclude_active(Resolution::Failed(err)).await;
            }
            None => debug!("Agent drained a retired transaction"),
        }
        self.advance().await;
    }

    async fn on_owner_changed(&mut self, old_owner: &str, new_owner: &str) {
        if new_owner.is_empty() && !old_owner.is_empty() {
            warn!(old_owner = %old_owner, "Package agent disappeared");
            self.agent_slot = AgentSlot::Idle;

            if self.queue.active_transaction().is_none() {
                info!("No active transaction when agent disappeared");
                return;
            }
            self.conclude_active(Resolution::Failed(TransactionError::AgentLost)).await;
            self.flush_queue(TransactionError::AgentLost).await;
            self.advance().await;
        } else if old_owner.is_empty() {
            info!(new_owner = %new_owner, "Package agent appeared");
        } else {
            info!(old_owner = %old_owner, new_owner = %new_owner, "Package agent owner changed");
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Hand the Active transaction to the agent once the slot is free.
    ///
    /// Loops rather than recursing: a refused dispatch fails the
    /// transaction and the next one gets its turn.
    async fn dispatch_if_ready(&mut self) {
        loop {
            if self.agent_slot != AgentSlot::Idle {
                return;
            }
            let Some(txn) = self.queue.active_mut() else {
                return;
            };
            if txn.phase != Some(Phase::Waiting) {
                return;
            }
            if let Err(e) = txn.enter_phase(Phase::Authorizing) {
                error!(transaction_id = %txn.id, error = %e, "Cannot dispatch");
                return;
            }

            let id = txn.id.clone();
            let kind = txn.kind;
            let packages = txn.packages().clone();
            self.agent_slot = AgentSlot::Busy(id.clone());

            let dispatched = match kind {
                TransactionKind::Update => self.agent.update_cache().await,
                _ => self.agent.commit_changes(&packages).await,
            };
            match dispatched {
                Ok(()) => {
                    info!(transaction_id = %id, kind = %kind, "Transaction dispatched to agent");
                    return;
                }
                Err(e) => {
                    error!(transaction_id = %id, error = %e, "Agent refused transaction");
                    self.agent_slot = AgentSlot::Idle;
                    self.conclude_active(Resolution::Failed(TransactionError::Init)).await;
                    self.promote().await;
                }
            }
        }
    }

    /// Retire the Active transaction, publish its closing events and
    /// persist it. Promotion is left to the caller.
    async fn conclude_active(&mut self, resolution: Resolution) {
        let now = self.time_provider.now_millis();
        let Some(retired) = self.queue.retire_active(now, resolution) else {
            return;
        };
        self.publish_closing(&retired);
        self.persist(&retired).await;
    }

    /// Promote the queue head and hand it over if the agent is free
    async fn advance(&mut self) {
        self.promote().await;
        self.dispatch_if_ready().await;
    }

    async fn promote(&mut self) {
        if let Some(id) = self.queue.promote_next(self.time_provider.now_millis()) {
            self.persist_live(&id).await;
        }
    }

    async fn flush_queue(&mut self, err: TransactionError) {
        let failed = self
            .queue
            .fail_all_queued(self.time_provider.now_millis(), err);
        for txn in &failed {
            self.publish_closing(txn);
            self.persist(txn).await;
        }
    }

    /// Remove a proposed or queued transaction
    async fn withdraw(&mut self, id: &str) -> bool {
        let Some(removed) = self.queue.remove(id, self.time_provider.now_millis()) else {
            return false;
        };
        self.publish_closing(&removed);
        self.persist(&removed).await;
        true
    }

    async fn decline_and_cancel(&mut self, decline: Answer) {
        if let Err(e) = self.agent.answer_question(&decline).await {
            error!(error = %e, "Failed to forward declining answer");
        }
        self.conclude_active(Resolution::Cancelled).await;
        self.advance().await;
    }

    fn record_progress(
        &mut self,
        phase: Phase,
        percent: u8,
        detail: ProgressDetail,
    ) -> Option<ProgressUpdate> {
        let txn = self.queue.active_mut()?;
        if txn.phase != Some(phase) {
            let _ = txn.enter_phase(phase);
        }
        match txn.record_progress(percent) {
            Ok(true) => Some(ProgressUpdate {
                phase,
                percent: txn.progress_percent,
                detail,
            }),
            Ok(false) => {
                debug!(transaction_id = %txn.id, percent, "Regressing progress dropped");
                None
            }
            Err(e) => {
                warn!(transaction_id = %txn.id, error = %e, "Progress rejected");
                None
            }
        }
    }

    fn publish_closing(&mut self, txn: &Transaction) {
        let outcome = match txn.state {
            TransactionState::Finished => Outcome::Succeeded,
            TransactionState::Cancelled => Outcome::Cancelled,
            _ => Outcome::Failed,
        };
        if let Some(err) = &txn.error {
            self.events.publish(&txn.id, EventPayload::Error(err.clone()));
        }
        self.events.publish(&txn.id, EventPayload::Finished(outcome));
    }

    /// Active transaction the agent is working on right now
    fn live_target(&self) -> Option<TransactionId> {
        match (&self.agent_slot, self.queue.active_transaction()) {
            (AgentSlot::Busy(busy), Some(active)) if *busy == active.id => Some(busy.clone()),
            _ => None,
        }
    }

    /// Terminal in memory or in the store
    async fn is_finished(&self, id: &str) -> bool {
        if let Some(txn) = self.queue.lookup(id) {
            return txn.is_terminal();
        }
        match self.store.find_by_id(&id.to_string()).await {
            Ok(found) => found.is_some_and(|t| t.is_terminal()),
            Err(e) => {
                warn!(transaction_id = %id, error = %e, "History lookup failed");
                false
            }
        }
    }

    fn owned_by(&self, id: &str, session_id: &str) -> bool {
        self.queue.get(id).is_some_and(|t| t.owner == session_id)
    }

    async fn persist_live(&self, id: &str) {
        if let Some(txn) = self.queue.get(id) {
            let txn = txn.clone();
            self.persist(&txn).await;
        }
    }

    async fn persist(&self, txn: &Transaction) {
        if let Err(e) = self.store.save(txn).await {
            error!(transaction_id = %txn.id, state = %txn.state, error = %e, "Failed to persist transaction");
        }
    }
}

#[cfg(test)]
mod tests;
