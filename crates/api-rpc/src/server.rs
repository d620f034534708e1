//! JSON-RPC Server
//!
//! Serves HTTP and WebSocket on one TCP port. Subscriptions need WebSocket.

use crate::handler::RpcHandler;
use crate::types::{
    AnswerRequest, CreateRequest, HistoryRequest, OwnedTransactionRequest, SessionCloseRequest,
    SessionWatchRequest, TransactionRequest,
};
use jsonrpsee::core::SubscriptionResult;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::Params;
use jsonrpsee::{ConnectionId, Extensions, PendingSubscriptionSink, RpcModule, SubscriptionMessage};
use pkgtxn_core::application::queue::QueueSnapshot;
use pkgtxn_core::application::SchedulerHandle;
use pkgtxn_core::port::TransactionStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

// Localhost only: the daemon acts on behalf of local users
const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9631;

/// RPC Server Configuration
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
        }
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: Arc<RpcHandler>,
}

impl RpcServer {
    pub fn new(
        config: RpcServerConfig,
        scheduler: SchedulerHandle,
        store: Arc<dyn TransactionStore>,
    ) -> Self {
        Self {
            config,
            handler: Arc::new(RpcHandler::new(scheduler, store)),
        }
    }

    /// Start the JSON-RPC server
    ///
    /// Returns the bound address (port 0 picks a free one) and the handle
    /// used to stop the server.
    pub async fn start(self) -> Result<(SocketAddr, ServerHandle), String> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        let server = Server::builder()
            .build(&addr)
            .await
            .map_err(|e| format!("Failed to build server on {}: {}", addr, e))?;
        let local_addr = server
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        let module = build_module(self.handler).map_err(|e| e.to_string())?;

        info!(addr = %local_addr, "JSON-RPC server started");
        Ok((local_addr, server.start(module)))
    }
}

fn build_module(
    handler: Arc<RpcHandler>,
) -> Result<RpcModule<()>, jsonrpsee::core::RegisterMethodError> {
    let mut module = RpcModule::new(());

    // Sessions
    let h = handler.clone();
    module.register_async_method("session.open.v1", move |_, _, ext| {
        let h = h.clone();
        async move { h.open_session(connection_of(&ext)).await }
    })?;

    let h = handler.clone();
    module.register_async_method("session.close.v1", move |params, _, ext| {
        let h = h.clone();
        async move {
            let req: SessionCloseRequest = params.one()?;
            h.close_session(req, connection_of(&ext))
        }
    })?;

    let h = handler.clone();
    module.register_subscription(
        "session.watch.v1",
        "session.queue",
        "session.unwatch.v1",
        move |params, pending, _, _| watch_session(h.clone(), params, pending),
    )?;

    // Transactions
    let h = handler.clone();
    module.register_async_method("txn.create.v1", move |params, _, ext| {
        let h = h.clone();
        async move {
            let req: CreateRequest = params.one()?;
            h.create(req, connection_of(&ext)).await
        }
    })?;

    let h = handler.clone();
    module.register_async_method("txn.enqueue.v1", move |params, _, ext| {
        let h = h.clone();
        async move {
            let req: OwnedTransactionRequest = params.one()?;
            h.enqueue(req, connection_of(&ext)).await
        }
    })?;

    let h = handler.clone();
    module.register_async_method("txn.remove.v1", move |params, _, ext| {
        let h = h.clone();
        async move {
            let req: OwnedTransactionRequest = params.one()?;
            h.remove(req, connection_of(&ext)).await
        }
    })?;

    let h = handler.clone();
    module.register_async_method("txn.cancel.v1", move |params, _, ext| {
        let h = h.clone();
        async move {
            let req: OwnedTransactionRequest = params.one()?;
            h.cancel(req, connection_of(&ext)).await
        }
    })?;

    let h = handler.clone();
    module.register_async_method("txn.answer.v1", move |params, _, ext| {
        let h = h.clone();
        async move {
            let req: AnswerRequest = params.one()?;
            h.answer(req, connection_of(&ext)).await
        }
    })?;

    let h = handler.clone();
    module.register_async_method("txn.get.v1", move |params, _, _| {
        let h = h.clone();
        async move {
            let req: TransactionRequest = params.one()?;
            h.get(req).await
        }
    })?;

    let h = handler.clone();
    module.register_subscription(
        "txn.subscribe.v1",
        "txn.event",
        "txn.unsubscribe.v1",
        move |params, pending, _, _| stream_events(h.clone(), params, pending),
    )?;

    // Queue and history
    let h = handler.clone();
    module.register_async_method("queue.list.v1", move |_, _, _| {
        let h = h.clone();
        async move { h.queue_list().await }
    })?;

    let h = handler;
    module.register_async_method("history.recent.v1", move |params, _, _| {
        let h = h.clone();
        async move {
            let req: HistoryRequest = params.one()?;
            h.history(req).await
        }
    })?;

    Ok(module)
}

/// Connection the request arrived on, set by the server per connection
fn connection_of(ext: &Extensions) -> Option<ConnectionId> {
    ext.get::<ConnectionId>().copied()
}

/// txn.subscribe.v1: forward the transaction's events until its stream
/// closes or the client goes away
async fn stream_events(
    handler: Arc<RpcHandler>,
    params: Params<'static>,
    pending: PendingSubscriptionSink,
) -> SubscriptionResult {
    let req: TransactionRequest = match params.one() {
        Ok(req) => req,
        Err(e) => {
            pending.reject(e).await;
            return Ok(());
        }
    };
    let mut events = match handler.subscribe(&req).await {
        Ok(events) => events,
        Err(e) => {
            pending.reject(e).await;
            return Ok(());
        }
    };

    let sink = pending.accept().await?;
    debug!(transaction_id = %req.transaction_id, "Event subscription opened");

    loop {
        tokio::select! {
            _ = sink.closed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let msg = SubscriptionMessage::from_json(&event)?;
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(transaction_id = %req.transaction_id, "Event subscription closed");
    Ok(())
}

/// session.watch.v1: push queue snapshots; the session ends with the
/// subscription. Only the connection that opened the session may watch it.
async fn watch_session(
    handler: Arc<RpcHandler>,
    params: Params<'static>,
    pending: PendingSubscriptionSink,
) -> SubscriptionResult {
    let req: SessionWatchRequest = match params.one() {
        Ok(req) => req,
        Err(e) => {
            pending.reject(e).await;
            return Ok(());
        }
    };
    let conn = pending.connection_id();
    let (snapshot, changes) = match handler.watch_queue(&req.session_id, conn).await {
        Ok(watch) => watch,
        Err(e) => {
            pending.reject(e).await;
            return Ok(());
        }
    };

    let result = forward_queue(pending, &req.session_id, snapshot, changes).await;

    info!(session_id = %req.session_id, "Session watcher gone, closing session");
    handler.end_session(&req.session_id);
    result
}

async fn forward_queue(
    pending: PendingSubscriptionSink,
    session_id: &str,
    snapshot: QueueSnapshot,
    mut changes: broadcast::Receiver<QueueSnapshot>,
) -> SubscriptionResult {
    let sink = pending.accept().await?;
    if sink.send(SubscriptionMessage::from_json(&snapshot)?).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = sink.closed() => break,
            change = changes.recv() => match change {
                Ok(snapshot) => {
                    let msg = SubscriptionMessage::from_json(&snapshot)?;
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                // The next snapshot carries the full queue
                Err(RecvError::Lagged(skipped)) => {
                    debug!(session_id = %session_id, skipped, "Queue watcher lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
