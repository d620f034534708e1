//! JSON-RPC surface through the SDK client

mod common;

use common::{start, TestDaemon};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::rpc_params;
use jsonrpsee::server::ServerHandle;
use jsonrpsee::ws_client::WsClientBuilder;
use pkgtxn_api_rpc::error::code;
use pkgtxn_api_rpc::{RpcServer, RpcServerConfig};
use pkgtxn_core::application::{CancelOutcome, EnqueueOutcome};
use pkgtxn_core::domain::{
    EventPayload, Outcome, PackageMode, TransactionKind, TransactionState,
};
use pkgtxn_core::port::AgentSignal;
use pkgtxn_sdk::PkgTxnClient;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// The server stops when the returned handle is dropped
async fn listen(daemon: &TestDaemon) -> (SocketAddr, ServerHandle) {
    let config = RpcServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    };
    RpcServer::new(config, daemon.handle.clone(), daemon.store.clone())
        .start()
        .await
        .unwrap()
}

async fn serve(daemon: &TestDaemon) -> (PkgTxnClient, ServerHandle) {
    let (addr, handle) = listen(daemon).await;
    (connect(addr).await, handle)
}

async fn connect(addr: SocketAddr) -> PkgTxnClient {
    PkgTxnClient::connect(format!("ws://{}", addr)).await.unwrap()
}

fn install(name: &str) -> BTreeMap<String, PackageMode> {
    BTreeMap::from([(name.to_string(), PackageMode::Install)])
}

#[tokio::test]
async fn test_transaction_lifecycle_over_rpc() {
    let daemon = start().await;
    let (client, _server) = serve(&daemon).await;

    let session = client.open_session().await.unwrap();
    let created = client
        .create(&session, TransactionKind::Install, &install("vim"), true)
        .await
        .unwrap();
    assert_eq!(created.enqueued, Some(EnqueueOutcome::Activated));
    let id = created.transaction_id;

    let mut events = client.subscribe(&id).await.unwrap();

    daemon.signal(AgentSignal::WorkerStarted);
    daemon.signal(AgentSignal::DownloadProgress {
        percent: 50,
        speed_bytes_per_sec: Some(1024),
        eta_seconds: Some(3),
    });
    daemon.signal(AgentSignal::WorkerFinished { success: true });

    let mut received = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
    {
        let event = event.unwrap();
        let done = event.payload.is_terminal();
        received.push(event);
        if done {
            break;
        }
    }

    let sequences: Vec<u64> = received.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..received.len() as u64).collect::<Vec<_>>());
    assert_eq!(received[0].payload, EventPayload::Started);
    assert_eq!(
        received.last().map(|e| &e.payload),
        Some(&EventPayload::Finished(Outcome::Succeeded))
    );

    let txn = client.get(&id).await.unwrap();
    assert_eq!(txn.state, TransactionState::Finished);
    assert_eq!(txn.progress_percent, 100);

    let history = client.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, id);

    let queue = client.queue().await.unwrap();
    assert!(queue.queue.active.is_none());
    assert!(queue.transactions.is_empty());
}

#[tokio::test]
async fn test_cancel_is_owner_scoped() {
    let daemon = start().await;
    let (client, _server) = serve(&daemon).await;

    let owner = client.open_session().await.unwrap();
    let stranger = client.open_session().await.unwrap();

    let first = client
        .create(&owner, TransactionKind::Install, &install("vim"), true)
        .await
        .unwrap();
    let second = client
        .create(&owner, TransactionKind::Install, &install("git"), true)
        .await
        .unwrap();
    assert_eq!(second.enqueued, Some(EnqueueOutcome::Queued));

    let refused = client
        .cancel(&stranger, &second.transaction_id)
        .await
        .unwrap();
    assert_eq!(refused.outcome, CancelOutcome::NotOwner);

    let cancelled = client.cancel(&owner, &second.transaction_id).await.unwrap();
    assert_eq!(cancelled.outcome, CancelOutcome::Cancelled);
    let again = client.cancel(&owner, &second.transaction_id).await.unwrap();
    assert_eq!(again.outcome, CancelOutcome::AlreadyFinished);

    let queue = client.queue().await.unwrap();
    assert_eq!(queue.queue.active, Some(first.transaction_id));
    assert!(queue.queue.queued.is_empty());
}

#[tokio::test]
async fn test_errors_carry_rpc_codes() {
    let daemon = start().await;
    let (client, _server) = serve(&daemon).await;

    let err = client
        .create("no-such-session", TransactionKind::Install, &install("vim"), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(code::NOT_FOUND));

    let session = client.open_session().await.unwrap();
    let err = client
        .create(&session, TransactionKind::Install, &BTreeMap::new(), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(code::VALIDATION_ERROR));

    let err = client.get("txn-missing").await.unwrap_err();
    assert_eq!(err.code(), Some(code::NOT_FOUND));

    let err = client.history(0).await.unwrap_err();
    assert_eq!(err.code(), Some(code::VALIDATION_ERROR));
}

#[tokio::test]
async fn test_closing_watch_tears_down_session() {
    let daemon = start().await;
    let (client, _server) = serve(&daemon).await;

    let session = client.open_session().await.unwrap();
    let mut watch = client.watch_session(&session).await.unwrap();
    let initial = watch.next().await.unwrap().unwrap();
    assert!(initial.proposed.is_empty());

    let created = client
        .create(&session, TransactionKind::Remove, &install("nano"), false)
        .await
        .unwrap();
    assert!(created.enqueued.is_none());

    let change = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(change.proposed, vec![created.transaction_id.clone()]);

    drop(watch);

    // The unconfirmed transaction goes with the session
    let mut state = TransactionState::Proposed;
    for _ in 0..50 {
        state = client.get(&created.transaction_id).await.unwrap().state;
        if state != TransactionState::Proposed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, TransactionState::Cancelled);

    let err = client
        .create(&session, TransactionKind::Update, &BTreeMap::new(), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(code::NOT_FOUND));
}

#[tokio::test]
async fn test_session_ids_stay_with_their_connection() {
    let daemon = start().await;
    let (addr, _server) = listen(&daemon).await;
    let alice = connect(addr).await;
    let bob = connect(addr).await;

    let alice_session = alice.open_session().await.unwrap();
    let bob_session = bob.open_session().await.unwrap();
    let created = alice
        .create(&alice_session, TransactionKind::Install, &install("vim"), true)
        .await
        .unwrap();
    let id = created.transaction_id;
    daemon.signal(AgentSignal::DownloadProgress {
        percent: 10,
        speed_bytes_per_sec: None,
        eta_seconds: None,
    });

    let refused = bob.cancel(&bob_session, &id).await.unwrap();
    assert_eq!(refused.outcome, CancelOutcome::NotOwner);

    // Nothing another connection can read names the owning session
    let raw = WsClientBuilder::default()
        .build(format!("ws://{}", addr))
        .await
        .unwrap();
    let queue: Value = raw.request("queue.list.v1", rpc_params![]).await.unwrap();
    let txn: Value = raw
        .request("txn.get.v1", rpc_params![json!({ "transaction_id": id })])
        .await
        .unwrap();
    let history: Value = raw
        .request("history.recent.v1", rpc_params![json!({ "limit": 10 })])
        .await
        .unwrap();
    assert_eq!(queue["transactions"][0]["id"], json!(id));
    assert!(txn.get("owner").is_none());
    for response in [&queue, &txn, &history] {
        assert!(!response.to_string().contains(&alice_session));
    }

    // Knowing the id is not enough from a foreign connection
    let err = bob.cancel(&alice_session, &id).await.unwrap_err();
    assert_eq!(err.code(), Some(code::NOT_FOUND));
    let err = bob.close_session(&alice_session).await.unwrap_err();
    assert_eq!(err.code(), Some(code::NOT_FOUND));
    let err = bob.watch_session(&alice_session).await.unwrap_err();
    assert_eq!(err.code(), Some(code::NOT_FOUND));

    let txn = alice.get(&id).await.unwrap();
    assert_eq!(txn.state, TransactionState::Active);
    let cancelled = alice.cancel(&alice_session, &id).await.unwrap();
    assert_eq!(cancelled.outcome, CancelOutcome::Cancelled);
}
