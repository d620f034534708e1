//! RPC Request/Response Types
//!
//! Every method takes a single object parameter.

use pkgtxn_core::application::queue::{EnqueueOutcome, QueueSnapshot};
use pkgtxn_core::application::{AnswerOutcome, CancelOutcome};
use pkgtxn_core::domain::{
    Answer, PackageMode, SessionId, TransactionId, TransactionKind, TransactionView,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_HISTORY_LIMIT: u32 = 500;

/// session.open.v1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOpenResponse {
    pub session_id: SessionId,
}

/// session.close.v1
#[derive(Debug, Deserialize)]
pub struct SessionCloseRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCloseResponse {
    pub session_id: SessionId,
}

/// session.watch.v1 - Queue changes; closing the subscription ends the session
#[derive(Debug, Deserialize)]
pub struct SessionWatchRequest {
    pub session_id: SessionId,
}

/// txn.create.v1 - Propose a transaction, optionally enqueueing it
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub session_id: SessionId,
    pub kind: TransactionKind,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageMode>,
    #[serde(default)]
    pub enqueue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub transaction_id: TransactionId,
    /// Set when the request asked for an immediate enqueue
    pub enqueued: Option<EnqueueOutcome>,
}

/// Params shared by txn.enqueue.v1, txn.remove.v1 and txn.cancel.v1
#[derive(Debug, Deserialize)]
pub struct OwnedTransactionRequest {
    pub session_id: SessionId,
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResponse {
    pub transaction_id: TransactionId,
    pub outcome: EnqueueOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResponse {
    pub transaction_id: TransactionId,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub transaction_id: TransactionId,
    pub outcome: CancelOutcome,
}

/// txn.answer.v1
#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub session_id: SessionId,
    pub transaction_id: TransactionId,
    pub answer: Answer,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub transaction_id: TransactionId,
    pub outcome: AnswerOutcome,
}

/// txn.get.v1 and txn.subscribe.v1
#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    pub transaction_id: TransactionId,
}

/// queue.list.v1
#[derive(Debug, Clone, Serialize)]
pub struct QueueListResponse {
    pub queue: QueueSnapshot,
    /// Live transactions, Active first
    pub transactions: Vec<TransactionView>,
}

/// history.recent.v1
#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub transactions: Vec<TransactionView>,
}
