//! SDK Request/Response Types

use pkgtxn_core::application::queue::{EnqueueOutcome, QueueSnapshot};
use pkgtxn_core::application::{AnswerOutcome, CancelOutcome};
use pkgtxn_core::domain::{Answer, PackageMode, TransactionKind, TransactionView};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub(crate) struct SessionRequest<'a> {
    pub session_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionOpenResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRequest<'a> {
    pub session_id: &'a str,
    pub kind: TransactionKind,
    pub packages: &'a BTreeMap<String, PackageMode>,
    pub enqueue: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateResponse {
    pub transaction_id: String,
    pub enqueued: Option<EnqueueOutcome>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OwnedTransactionRequest<'a> {
    pub session_id: &'a str,
    pub transaction_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnswerRequest<'a> {
    pub session_id: &'a str,
    pub transaction_id: &'a str,
    pub answer: Answer,
}

#[derive(Debug, Serialize)]
pub(crate) struct TransactionRequest<'a> {
    pub transaction_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct HistoryRequest {
    pub limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueResponse {
    pub transaction_id: String,
    pub outcome: EnqueueOutcome,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveResponse {
    pub transaction_id: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelResponse {
    pub transaction_id: String,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerResponse {
    pub transaction_id: String,
    pub outcome: AnswerOutcome,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueListResponse {
    pub queue: QueueSnapshot,
    pub transactions: Vec<TransactionView>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HistoryResponse {
    pub transactions: Vec<TransactionView>,
}
