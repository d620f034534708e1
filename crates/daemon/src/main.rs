//! pkgtxn daemon - Main Entry Point
//!
//! Wires the SQLite history, the worker-process agent and the JSON-RPC
//! surface around a single scheduler.

mod config;
mod logging;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use config::DaemonConfig;
use pkgtxn_api_rpc::{RpcServer, RpcServerConfig};
use pkgtxn_core::application::{
    channel, shutdown_channel, RecoveryService, Scheduler, SchedulerConfig,
};
use pkgtxn_core::port::{SystemTimeProvider, TransactionStore, UuidProvider};
use pkgtxn_infra_sqlite::{create_pool, run_migrations, SqliteTransactionStore};
use pkgtxn_infra_system::{SubprocessAgent, SubprocessAgentConfig};

const SCHEDULER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging
    let config = DaemonConfig::from_env()?;
    let _log_guard = logging::init_logging(config.log_format, config.log_dir.as_deref())?;

    info!("pkgtxn daemon v{} starting...", pkgtxn_core::VERSION);

    // 2. History database
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    info!(db_path = %config.db_path.display(), "Opening transaction history");

    let pool = create_pool(&config.database_url())
        .await
        .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    let time_provider = Arc::new(SystemTimeProvider);
    let store: Arc<dyn TransactionStore> = Arc::new(SqliteTransactionStore::new(pool));

    // 3. Crash recovery before anything can be scheduled
    let recovery = RecoveryService::new(store.clone(), time_provider.clone());
    match recovery.recover_orphaned_transactions().await {
        Ok(count) => info!(recovered = count, "Crash recovery completed"),
        Err(e) => error!(error = %e, "Crash recovery failed"),
    }
    if let Err(e) = recovery.prune_history(config.history_retention_days).await {
        error!(error = %e, "History pruning failed");
    }

    // 4. Scheduler and agent
    let (handle, sink, inbox) = channel();
    let agent = Arc::new(SubprocessAgent::new(
        SubprocessAgentConfig::new(config.agent_command.clone(), config.agent_args.clone()),
        sink,
    ));
    let scheduler = Scheduler::new(
        inbox,
        SchedulerConfig::default(),
        agent.clone(),
        store.clone(),
        Arc::new(UuidProvider),
        time_provider,
    );

    let (shutdown_trigger, shutdown_listener) = shutdown_channel();
    let scheduler_task = tokio::spawn(async move {
        if let Err(e) = scheduler.run(shutdown_listener).await {
            error!(error = %e, "Scheduler failed");
        }
    });

    // 5. JSON-RPC server
    let rpc_config = RpcServerConfig {
        host: config.rpc_host.clone(),
        port: config.rpc_port,
    };
    let (addr, rpc_handle) = RpcServer::new(rpc_config, handle, store)
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("RPC server start failed: {}", e))?;

    info!(addr = %addr, agent = %config.agent_command, "Daemon ready");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 7. Graceful shutdown: stop taking requests, stop the scheduler,
    // then the worker
    if let Err(e) = rpc_handle.stop() {
        error!(error = %e, "RPC server stop failed");
    }
    shutdown_trigger.trigger();
    if tokio::time::timeout(SCHEDULER_STOP_TIMEOUT, scheduler_task)
        .await
        .is_err()
    {
        error!("Scheduler did not stop in time");
    }
    agent.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}
