// Transaction Store Port (Interface)

use crate::domain::{Transaction, TransactionId};
use crate::error::Result;
use async_trait::async_trait;

/// Durable record of transactions.
///
/// The scheduler writes through this port at every lifecycle edge but
/// never reads from it; in-memory state is authoritative while running.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert or replace a transaction record
    async fn save(&self, txn: &Transaction) -> Result<()>;

    /// Find transaction by ID
    async fn find_by_id(&self, id: &TransactionId) -> Result<Option<Transaction>>;

    /// All records not in a terminal state (for recovery)
    async fn find_unfinished(&self) -> Result<Vec<Transaction>>;

    /// Most recently created first
    async fn recent(&self, limit: u32) -> Result<Vec<Transaction>>;

    /// Delete terminal records that finished before `cutoff_millis`
    async fn prune_finished_before(&self, cutoff_millis: i64) -> Result<u64>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// HashMap-backed store
    #[derive(Default)]
    pub struct InMemoryTransactionStore {
        records: Mutex<HashMap<TransactionId, Transaction>>,
        fail_writes: AtomicBool,
    }

    impl InMemoryTransactionStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every following save fail
        pub fn fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        pub fn get(&self, id: &str) -> Option<Transaction> {
            self.records.lock().unwrap().get(id).cloned()
        }

        pub fn len(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl TransactionStore for InMemoryTransactionStore {
        async fn save(&self, txn: &Transaction) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(AppError::Store("write refused".to_string()));
            }
            self.records
                .lock()
                .unwrap()
                .insert(txn.id.clone(), txn.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: &TransactionId) -> Result<Option<Transaction>> {
            Ok(self.get(id))
        }

        async fn find_unfinished(&self) -> Result<Vec<Transaction>> {
            let mut found: Vec<Transaction> = self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|t| !t.is_terminal())
                .cloned()
                .collect();
            found.sort_by_key(|t| t.created_at);
            Ok(found)
        }

        async fn recent(&self, limit: u32) -> Result<Vec<Transaction>> {
            let mut all: Vec<Transaction> =
                self.records.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            all.truncate(limit as usize);
            Ok(all)
        }

        async fn prune_finished_before(&self, cutoff_millis: i64) -> Result<u64> {
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|_, t| !matches!(t.finished_at, Some(at) if t.is_terminal() && at < cutoff_millis));
            Ok((before - records.len()) as u64)
        }
    }
}
