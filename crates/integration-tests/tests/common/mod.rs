//! Shared wiring: a scheduler over a real SQLite store and a mock agent
#![allow(dead_code)]

use pkgtxn_core::application::{
    channel, shutdown_channel, AgentSink, Scheduler, SchedulerConfig, SchedulerHandle,
    ShutdownTrigger,
};
use pkgtxn_core::domain::{PackageMode, PackageSet, Transaction};
use pkgtxn_core::port::id_provider::mocks::SequentialIdProvider;
use pkgtxn_core::port::package_agent::mocks::MockPackageAgent;
use pkgtxn_core::port::time_provider::mocks::FixedTimeProvider;
use pkgtxn_core::port::{AgentNotice, AgentSignal};
use pkgtxn_infra_sqlite::{create_pool, run_migrations, SqliteTransactionStore};
use std::sync::Arc;

pub struct TestDaemon {
    pub handle: SchedulerHandle,
    pub sink: AgentSink,
    pub agent: Arc<MockPackageAgent>,
    pub store: Arc<SqliteTransactionStore>,
    pub trigger: ShutdownTrigger,
}

pub async fn memory_store() -> Arc<SqliteTransactionStore> {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(SqliteTransactionStore::new(pool))
}

pub async fn start() -> TestDaemon {
    start_with_store(memory_store().await)
}

pub fn start_with_store(store: Arc<SqliteTransactionStore>) -> TestDaemon {
    let (handle, sink, inbox) = channel();
    let agent = Arc::new(MockPackageAgent::new());
    let scheduler = Scheduler::new(
        inbox,
        SchedulerConfig::default(),
        agent.clone(),
        store.clone(),
        Arc::new(SequentialIdProvider::new()),
        Arc::new(FixedTimeProvider::new(1_000)),
    );
    let (trigger, listener) = shutdown_channel();
    tokio::spawn(scheduler.run(listener));

    TestDaemon {
        handle,
        sink,
        agent,
        store,
        trigger,
    }
}

impl TestDaemon {
    pub fn signal(&self, signal: AgentSignal) {
        assert!(self.sink.notify(AgentNotice::Signal(signal)));
    }

    pub fn agent_lost(&self) {
        assert!(self.sink.notify(AgentNotice::OwnerChanged {
            old_owner: "4242".to_string(),
            new_owner: String::new(),
        }));
    }

    /// Goes through the scheduler, so every earlier notice has been applied
    pub async fn txn(&self, id: &str) -> Transaction {
        self.handle.transaction(id).await.unwrap().unwrap()
    }
}

pub fn packages(names: &[&str], mode: PackageMode) -> PackageSet {
    PackageSet::with_mode(names.iter().copied(), mode).unwrap()
}
