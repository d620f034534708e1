// Crash recovery for transactions left behind by a previous daemon
use crate::domain::{TransactionError, TransactionState};
use crate::port::{TimeProvider, TransactionStore};
use std::sync::Arc;
use tracing::{info, warn};

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Crash recovery service
///
/// On daemon startup, fails every stored transaction that was still in
/// flight when the previous instance died.
pub struct RecoveryService {
    store: Arc<dyn TransactionStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn TransactionStore>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            store,
            time_provider,
        }
    }

    /// Mark every non-terminal stored transaction as Failed(AgentLost).
    ///
    /// Must run before the scheduler starts. Proposed and queued
    /// transactions are failed too: their sessions died with the daemon.
    ///
    /// # Returns
    /// Number of transactions recovered
    pub async fn recover_orphaned_transactions(&self) -> crate::error::Result<usize> {
        let now = self.time_provider.now_millis();
        let orphans = self.store.find_unfinished().await?;

        info!(count = orphans.len(), "Starting orphaned transaction recovery");

        let mut recovered_count = 0;
        for mut txn in orphans {
            let previous = txn.state;
            if let Err(e) = txn.fail(now, TransactionError::AgentLost) {
                warn!(transaction_id = %txn.id, error = %e, "Skipping unrecoverable record");
                continue;
            }
            if previous == TransactionState::Active {
                warn!(
                    transaction_id = %txn.id,
                    phase = ?txn.phase,
                    "Transaction was active when the daemon stopped"
                );
            }
            self.store.save(&txn).await?;
            recovered_count += 1;
        }

        info!(recovered_count = %recovered_count, "Orphaned transaction recovery complete");
        Ok(recovered_count)
    }

    /// Delete finished history older than `retention_days`
    pub async fn prune_history(&self, retention_days: u32) -> crate::error::Result<u64> {
        let cutoff = self.time_provider.now_millis() - i64::from(retention_days) * MILLIS_PER_DAY;
        let pruned = self.store.prune_finished_before(cutoff).await?;
        info!(pruned = %pruned, retention_days = %retention_days, "Transaction history pruned");
        Ok(pruned)
    }
}
