//! RPC Method Handlers
//!
//! Thin translation between RPC types and the scheduler handle. All queue
//! state lives in the scheduler; the handler adds the history store and
//! pins each session to the connection that opened it.

use crate::error::to_rpc_error;
use crate::types::{
    AnswerRequest, AnswerResponse, CancelResponse, CreateRequest, CreateResponse,
    EnqueueResponse, HistoryRequest, HistoryResponse, OwnedTransactionRequest,
    QueueListResponse, RemoveResponse, SessionCloseRequest, SessionCloseResponse,
    SessionOpenResponse, TransactionRequest, MAX_HISTORY_LIMIT,
};
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::ConnectionId;
use pkgtxn_core::application::queue::QueueSnapshot;
use pkgtxn_core::application::{EventStream, SchedulerHandle};
use pkgtxn_core::domain::{PackageSet, SessionId, TransactionView};
use pkgtxn_core::error::AppError;
use pkgtxn_core::port::TransactionStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

type RpcResult<T> = Result<T, ErrorObjectOwned>;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    scheduler: SchedulerHandle,
    store: Arc<dyn TransactionStore>,
    /// Session -> connection it was opened on
    connections: Mutex<HashMap<SessionId, ConnectionId>>,
}

impl RpcHandler {
    pub fn new(scheduler: SchedulerHandle, store: Arc<dyn TransactionStore>) -> Self {
        Self {
            scheduler,
            store,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Reject session ids that were not opened on `conn`.
    ///
    /// A foreign session looks the same as an unknown one.
    pub fn authorize(&self, session_id: &str, conn: Option<ConnectionId>) -> RpcResult<()> {
        let connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        match (connections.get(session_id), conn) {
            (Some(opened_on), Some(conn)) if *opened_on == conn => Ok(()),
            (Some(_), _) => {
                warn!(session_id = %session_id, ?conn, "Session used from another connection");
                Err(unknown_session(session_id))
            }
            (None, _) => Err(unknown_session(session_id)),
        }
    }

    /// session.open.v1
    pub async fn open_session(&self, conn: Option<ConnectionId>) -> RpcResult<SessionOpenResponse> {
        let Some(conn) = conn else {
            return Err(to_rpc_error(AppError::Internal(
                "connection id missing from request".to_string(),
            )));
        };
        let session_id = self.scheduler.open_session().await.map_err(to_rpc_error)?;
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), conn);
        debug!(session_id = %session_id, conn = conn.0, "Session bound to connection");
        Ok(SessionOpenResponse { session_id })
    }

    /// session.close.v1
    pub fn close_session(
        &self,
        params: SessionCloseRequest,
        conn: Option<ConnectionId>,
    ) -> RpcResult<SessionCloseResponse> {
        self.authorize(&params.session_id, conn)?;
        self.end_session(&params.session_id);
        Ok(SessionCloseResponse {
            session_id: params.session_id,
        })
    }

    /// Close an already authorized session
    pub fn end_session(&self, session_id: &str) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        self.scheduler.close_session(session_id);
    }

    /// txn.create.v1
    pub async fn create(
        &self,
        params: CreateRequest,
        conn: Option<ConnectionId>,
    ) -> RpcResult<CreateResponse> {
        self.authorize(&params.session_id, conn)?;
        let packages = PackageSet::new(params.packages)
            .map_err(|e| to_rpc_error(AppError::Domain(e)))?;

        let transaction_id = self
            .scheduler
            .create(&params.session_id, params.kind, packages)
            .await
            .map_err(to_rpc_error)?;

        let enqueued = if params.enqueue {
            Some(
                self.scheduler
                    .enqueue(&params.session_id, &transaction_id)
                    .await
                    .map_err(to_rpc_error)?,
            )
        } else {
            None
        };

        Ok(CreateResponse {
            transaction_id,
            enqueued,
        })
    }

    /// txn.enqueue.v1
    pub async fn enqueue(
        &self,
        params: OwnedTransactionRequest,
        conn: Option<ConnectionId>,
    ) -> RpcResult<EnqueueResponse> {
        self.authorize(&params.session_id, conn)?;
        let outcome = self
            .scheduler
            .enqueue(&params.session_id, &params.transaction_id)
            .await
            .map_err(to_rpc_error)?;
        Ok(EnqueueResponse {
            transaction_id: params.transaction_id,
            outcome,
        })
    }

    /// txn.remove.v1
    pub async fn remove(
        &self,
        params: OwnedTransactionRequest,
        conn: Option<ConnectionId>,
    ) -> RpcResult<RemoveResponse> {
        self.authorize(&params.session_id, conn)?;
        let removed = self
            .scheduler
            .remove(&params.session_id, &params.transaction_id)
            .await
            .map_err(to_rpc_error)?;
        Ok(RemoveResponse {
            transaction_id: params.transaction_id,
            removed,
        })
    }

    /// txn.cancel.v1
    pub async fn cancel(
        &self,
        params: OwnedTransactionRequest,
        conn: Option<ConnectionId>,
    ) -> RpcResult<CancelResponse> {
        self.authorize(&params.session_id, conn)?;
        let outcome = self
            .scheduler
            .cancel(&params.session_id, &params.transaction_id)
            .await
            .map_err(to_rpc_error)?;
        Ok(CancelResponse {
            transaction_id: params.transaction_id,
            outcome,
        })
    }

    /// txn.answer.v1
    pub async fn answer(
        &self,
        params: AnswerRequest,
        conn: Option<ConnectionId>,
    ) -> RpcResult<AnswerResponse> {
        self.authorize(&params.session_id, conn)?;
        let outcome = self
            .scheduler
            .answer(&params.session_id, &params.transaction_id, params.answer)
            .await
            .map_err(to_rpc_error)?;
        Ok(AnswerResponse {
            transaction_id: params.transaction_id,
            outcome,
        })
    }

    /// txn.get.v1 - Live transactions first, then persisted history
    pub async fn get(&self, params: TransactionRequest) -> RpcResult<TransactionView> {
        if let Some(txn) = self
            .scheduler
            .transaction(&params.transaction_id)
            .await
            .map_err(to_rpc_error)?
        {
            return Ok(txn.into());
        }

        debug!(transaction_id = %params.transaction_id, "Not live, checking history");
        self.store
            .find_by_id(&params.transaction_id)
            .await
            .map_err(to_rpc_error)?
            .map(TransactionView::from)
            .ok_or_else(|| {
                to_rpc_error(AppError::NotFound(format!(
                    "Transaction {} not found",
                    params.transaction_id
                )))
            })
    }

    /// queue.list.v1
    pub async fn queue_list(&self) -> RpcResult<QueueListResponse> {
        let listing = self.scheduler.list().await.map_err(to_rpc_error)?;
        Ok(QueueListResponse {
            queue: listing.snapshot,
            transactions: listing.transactions.into_iter().map(Into::into).collect(),
        })
    }

    /// history.recent.v1
    pub async fn history(&self, params: HistoryRequest) -> RpcResult<HistoryResponse> {
        if params.limit == 0 || params.limit > MAX_HISTORY_LIMIT {
            return Err(to_rpc_error(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_HISTORY_LIMIT
            ))));
        }
        let transactions = self.store.recent(params.limit).await.map_err(to_rpc_error)?;
        Ok(HistoryResponse {
            transactions: transactions.into_iter().map(Into::into).collect(),
        })
    }

    /// txn.subscribe.v1
    pub async fn subscribe(&self, params: &TransactionRequest) -> RpcResult<EventStream> {
        self.scheduler
            .subscribe(&params.transaction_id)
            .await
            .map_err(to_rpc_error)
    }

    /// session.watch.v1
    pub async fn watch_queue(
        &self,
        session_id: &str,
        conn: ConnectionId,
    ) -> RpcResult<(QueueSnapshot, broadcast::Receiver<QueueSnapshot>)> {
        self.authorize(session_id, Some(conn))?;
        self.scheduler.watch_queue().await.map_err(to_rpc_error)
    }
}

fn unknown_session(session_id: &str) -> ErrorObjectOwned {
    to_rpc_error(AppError::NotFound(format!("session {}", session_id)))
}
