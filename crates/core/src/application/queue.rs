// Transaction Queue
// Admission control and single-flight ordering. Plain state, no I/O:
// the scheduler reactor is its only owner.

use crate::domain::{DomainError, Transaction, TransactionError, TransactionId, TransactionState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Read-only view of the queue handed to observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub active: Option<TransactionId>,
    /// Confirmed, in execution order
    pub queued: Vec<TransactionId>,
    /// Not yet confirmed
    pub proposed: Vec<TransactionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnqueueOutcome {
    /// Waiting behind another transaction
    Queued,
    /// Promoted straight to Active
    Activated,
    /// Unknown id or not in the proposed set
    Ignored,
}

/// How the Active transaction ends
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Finished,
    Failed(TransactionError),
    Cancelled,
}

pub struct TransactionQueue {
    transactions: HashMap<TransactionId, Transaction>,
    proposed: Vec<TransactionId>,
    queued: VecDeque<TransactionId>,
    active: Option<TransactionId>,
    retired: HashMap<TransactionId, Transaction>,
    retired_order: VecDeque<TransactionId>,
    retired_capacity: usize,
    changes: broadcast::Sender<QueueSnapshot>,
}

impl TransactionQueue {
    pub fn new(retired_capacity: usize, notify_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(notify_capacity.max(1));
        Self {
            transactions: HashMap::new(),
            proposed: Vec::new(),
            queued: VecDeque::new(),
            active: None,
            retired: HashMap::new(),
            retired_order: VecDeque::new(),
            retired_capacity,
            changes,
        }
    }

    /// Register an unconfirmed transaction. Does not touch execution order.
    pub fn add_pending(&mut self, txn: Transaction) -> Result<TransactionId, DomainError> {
        if txn.state != TransactionState::Proposed {
            return Err(DomainError::ValidationError(format!(
                "only proposed transactions can be added, got {}",
                txn.state
            )));
        }
        if self.transactions.contains_key(&txn.id) || self.retired.contains_key(&txn.id) {
            return Err(DomainError::DuplicateTransaction(txn.id));
        }

        let id = txn.id.clone();
        self.proposed.push(id.clone());
        self.transactions.insert(id.clone(), txn);
        debug!(transaction_id = %id, "Transaction proposed");
        self.notify();
        Ok(id)
    }

    /// Confirm a proposed transaction and append it to the execution queue.
    ///
    /// Promotes it at once when nothing is Active.
    pub fn enqueue(&mut self, id: &str, now_millis: i64) -> EnqueueOutcome {
        let Some(pos) = self.proposed.iter().position(|p| p == id) else {
            warn!(transaction_id = %id, "Enqueue ignored: not a proposed transaction");
            return EnqueueOutcome::Ignored;
        };
        let Some(txn) = self.transactions.get_mut(id) else {
            warn!(transaction_id = %id, "Enqueue ignored: transaction record missing");
            return EnqueueOutcome::Ignored;
        };
        if let Err(e) = txn.confirm() {
            warn!(transaction_id = %id, error = %e, "Enqueue ignored");
            return EnqueueOutcome::Ignored;
        }

        self.proposed.remove(pos);
        self.queued.push_back(id.to_string());
        info!(transaction_id = %id, position = self.queued.len(), "Transaction queued");

        // promote_next notifies on success
        match self.promote_next(now_millis) {
            Some(promoted) if promoted == id => EnqueueOutcome::Activated,
            Some(_) => EnqueueOutcome::Queued,
            None => {
                self.notify();
                EnqueueOutcome::Queued
            }
        }
    }

    /// Withdraw a transaction that has not started. It ends Cancelled.
    ///
    /// Returns None for the Active transaction, unknown ids and ids that
    /// were already removed.
    pub fn remove(&mut self, id: &str, now_millis: i64) -> Option<Transaction> {
        if let Some(pos) = self.proposed.iter().position(|p| p == id) {
            self.proposed.remove(pos);
        } else if let Some(pos) = self.queued.iter().position(|q| q == id) {
            self.queued.remove(pos);
        } else {
            debug!(transaction_id = %id, "Remove ignored: not proposed or queued");
            return None;
        }

        let mut txn = self.transactions.remove(id)?;
        if let Err(e) = txn.cancel(now_millis) {
            warn!(transaction_id = %id, error = %e, "Removed transaction could not be cancelled");
        }
        info!(transaction_id = %id, "Transaction removed");
        self.retire(txn.clone());
        self.notify();
        Some(txn)
    }

    /// Resolve the Active transaction. Does not promote the next one.
    pub fn retire_active(&mut self, now_millis: i64, resolution: Resolution) -> Option<Transaction> {
        let id = self.active.take()?;
        let mut txn = self.transactions.remove(&id)?;

        let applied = match resolution {
            Resolution::Finished => txn.finish(now_millis),
            Resolution::Failed(err) => txn.fail(now_millis, err),
            Resolution::Cancelled => txn.cancel(now_millis),
        };
        if let Err(e) = applied {
            warn!(transaction_id = %id, error = %e, "Active transaction resolved from unexpected state");
        }

        info!(transaction_id = %id, state = %txn.state, "Transaction retired");
        self.retire(txn.clone());
        self.notify();
        Some(txn)
    }

    /// Promote the head of the queue if nothing is Active
    pub fn promote_next(&mut self, now_millis: i64) -> Option<TransactionId> {
        if self.active.is_some() {
            return None;
        }

        while let Some(id) = self.queued.pop_front() {
            let Some(txn) = self.transactions.get_mut(&id) else {
                warn!(transaction_id = %id, "Queued id without record, skipping");
                continue;
            };
            if let Err(e) = txn.activate(now_millis) {
                warn!(transaction_id = %id, error = %e, "Queued transaction could not be activated, skipping");
                continue;
            }
            info!(transaction_id = %id, "Transaction promoted to active");
            self.active = Some(id.clone());
            self.notify();
            return Some(id);
        }
        None
    }

    /// Fail every confirmed transaction still waiting. Proposed ones stay.
    pub fn fail_all_queued(&mut self, now_millis: i64, error: TransactionError) -> Vec<Transaction> {
        let mut failed = Vec::with_capacity(self.queued.len());
        while let Some(id) = self.queued.pop_front() {
            let Some(mut txn) = self.transactions.remove(&id) else {
                continue;
            };
            if let Err(e) = txn.fail(now_millis, error.clone()) {
                warn!(transaction_id = %id, error = %e, "Queued transaction could not be failed");
            }
            self.retire(txn.clone());
            failed.push(txn);
        }

        if !failed.is_empty() {
            warn!(count = failed.len(), error = %error, "Flushed queued transactions");
            self.notify();
        }
        failed
    }

    /// Live transaction (proposed, queued or active)
    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Transaction> {
        self.transactions.get_mut(id)
    }

    /// Live or recently retired transaction
    pub fn lookup(&self, id: &str) -> Option<&Transaction> {
        self.transactions.get(id).or_else(|| self.retired.get(id))
    }

    pub fn active_transaction(&self) -> Option<&Transaction> {
        self.active.as_ref().and_then(|id| self.transactions.get(id))
    }

    pub fn active_mut(&mut self) -> Option<&mut Transaction> {
        let id = self.active.as_ref()?;
        self.transactions.get_mut(id)
    }

    /// Known live transactions: Active first, then queued, then proposed
    pub fn transactions(&self) -> Vec<&Transaction> {
        self.active
            .iter()
            .chain(self.queued.iter())
            .chain(self.proposed.iter())
            .filter_map(|id| self.transactions.get(id))
            .collect()
    }

    /// Unconfirmed transactions created by `owner`
    pub fn proposed_by(&self, owner: &str) -> Vec<TransactionId> {
        self.proposed
            .iter()
            .filter(|id| self.transactions.get(*id).is_some_and(|t| t.owner == owner))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            active: self.active.clone(),
            queued: self.queued.iter().cloned().collect(),
            proposed: self.proposed.clone(),
        }
    }

    /// Receive a snapshot after every structural change
    pub fn subscribe_changes(&self) -> broadcast::Receiver<QueueSnapshot> {
        self.changes.subscribe()
    }

    /// At most one Active transaction and no id in two sets at once
    pub fn invariants_hold(&self) -> bool {
        let active_count = self
            .transactions
            .values()
            .filter(|t| t.state == TransactionState::Active)
            .count();
        if active_count > 1 || (active_count == 1) != self.active.is_some() {
            return false;
        }

        let mut seen = HashSet::new();
        let live = self
            .active
            .iter()
            .chain(self.queued.iter())
            .chain(self.proposed.iter());
        for id in live {
            if !seen.insert(id) || self.retired.contains_key(id) {
                return false;
            }
        }
        seen.len() == self.transactions.len()
    }

    fn retire(&mut self, txn: Transaction) {
        if self.retired_capacity == 0 {
            return;
        }
        while self.retired_order.len() >= self.retired_capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired_order.push_back(txn.id.clone());
        self.retired.insert(txn.id.clone(), txn);
    }

    fn notify(&self) {
        // No watchers is fine
        let _ = self.changes.send(self.snapshot());
    }
}
