//! pkgtxn Client Implementation

use crate::error::{Result, SdkError};
use crate::types::{
    AnswerRequest, AnswerResponse, CancelResponse, CreateRequest, CreateResponse,
    EnqueueResponse, HistoryRequest, HistoryResponse, OwnedTransactionRequest,
    QueueListResponse, RemoveResponse, SessionOpenResponse, SessionRequest, TransactionRequest,
};
use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use pkgtxn_core::application::queue::QueueSnapshot;
use pkgtxn_core::domain::{Answer, PackageMode, TransactionEvent, TransactionKind, TransactionView};
use std::collections::BTreeMap;
use std::time::Duration;

/// pkgtxn daemon client
///
/// Wraps a WebSocket connection. Transaction events and queue changes
/// arrive as [`Subscription`] streams.
///
/// # Example
///
/// ```no_run
/// use pkgtxn_sdk::PkgTxnClient;
/// use pkgtxn_core::domain::{PackageMode, TransactionKind};
/// use std::collections::BTreeMap;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = PkgTxnClient::connect("ws://127.0.0.1:9631").await?;
/// let session = client.open_session().await?;
///
/// let packages = BTreeMap::from([("vim".to_string(), PackageMode::Install)]);
/// let created = client
///     .create(&session, TransactionKind::Install, &packages, true)
///     .await?;
///
/// let mut events = client.subscribe(&created.transaction_id).await?;
/// while let Some(event) = events.next().await {
///     println!("{:?}", event?.payload);
/// }
/// # Ok(())
/// # }
/// ```
pub struct PkgTxnClient {
    client: WsClient,
}

impl PkgTxnClient {
    /// Connect to the daemon
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket endpoint (e.g., `ws://127.0.0.1:9631`)
    pub async fn connect(url: impl AsRef<str>) -> Result<Self> {
        let url = url.as_ref();

        let client = WsClientBuilder::default()
            .request_timeout(Duration::from_secs(30))
            .build(url)
            .await
            .map_err(|e| SdkError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        Ok(Self { client })
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Open a session. Transactions created through it are owned by it.
    ///
    /// The session is only usable from this client's connection.
    pub async fn open_session(&self) -> Result<String> {
        let response: SessionOpenResponse =
            self.client.request("session.open.v1", rpc_params![]).await?;
        Ok(response.session_id)
    }

    /// Close a session: its proposed transactions are discarded and a
    /// question it owes an answer to is declined
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request("session.close.v1", rpc_params![SessionRequest { session_id }])
            .await?;
        Ok(())
    }

    /// Queue snapshots for as long as the returned subscription lives.
    /// Dropping it closes `session_id`.
    pub async fn watch_session(&self, session_id: &str) -> Result<Subscription<QueueSnapshot>> {
        let subscription = self
            .client
            .subscribe(
                "session.watch.v1",
                rpc_params![SessionRequest { session_id }],
                "session.unwatch.v1",
            )
            .await?;
        Ok(subscription)
    }

    /// Propose a transaction; with `enqueue` it is confirmed right away
    pub async fn create(
        &self,
        session_id: &str,
        kind: TransactionKind,
        packages: &BTreeMap<String, PackageMode>,
        enqueue: bool,
    ) -> Result<CreateResponse> {
        let request = CreateRequest {
            session_id,
            kind,
            packages,
            enqueue,
        };
        let response = self.client.request("txn.create.v1", rpc_params![request]).await?;
        Ok(response)
    }

    pub async fn enqueue(&self, session_id: &str, transaction_id: &str) -> Result<EnqueueResponse> {
        let request = OwnedTransactionRequest {
            session_id,
            transaction_id,
        };
        let response = self.client.request("txn.enqueue.v1", rpc_params![request]).await?;
        Ok(response)
    }

    pub async fn remove(&self, session_id: &str, transaction_id: &str) -> Result<RemoveResponse> {
        let request = OwnedTransactionRequest {
            session_id,
            transaction_id,
        };
        let response = self.client.request("txn.remove.v1", rpc_params![request]).await?;
        Ok(response)
    }

    pub async fn cancel(&self, session_id: &str, transaction_id: &str) -> Result<CancelResponse> {
        let request = OwnedTransactionRequest {
            session_id,
            transaction_id,
        };
        let response = self.client.request("txn.cancel.v1", rpc_params![request]).await?;
        Ok(response)
    }

    pub async fn answer(
        &self,
        session_id: &str,
        transaction_id: &str,
        answer: Answer,
    ) -> Result<AnswerResponse> {
        let request = AnswerRequest {
            session_id,
            transaction_id,
            answer,
        };
        let response = self.client.request("txn.answer.v1", rpc_params![request]).await?;
        Ok(response)
    }

    /// Live or historical transaction
    pub async fn get(&self, transaction_id: &str) -> Result<TransactionView> {
        let response = self
            .client
            .request("txn.get.v1", rpc_params![TransactionRequest { transaction_id }])
            .await?;
        Ok(response)
    }

    /// Ordered events of one transaction, replayed from the first.
    /// The subscription ends after the `Finished` event.
    pub async fn subscribe(&self, transaction_id: &str) -> Result<Subscription<TransactionEvent>> {
        let subscription = self
            .client
            .subscribe(
                "txn.subscribe.v1",
                rpc_params![TransactionRequest { transaction_id }],
                "txn.unsubscribe.v1",
            )
            .await?;
        Ok(subscription)
    }

    pub async fn queue(&self) -> Result<QueueListResponse> {
        let response = self.client.request("queue.list.v1", rpc_params![]).await?;
        Ok(response)
    }

    /// Most recent transactions from the daemon's history, newest first
    pub async fn history(&self, limit: u32) -> Result<Vec<TransactionView>> {
        let response: HistoryResponse = self
            .client
            .request("history.recent.v1", rpc_params![HistoryRequest { limit }])
            .await?;
        Ok(response.transactions)
    }
}
