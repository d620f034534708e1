// Subprocess agent implementation
// Drives the privileged worker over line-delimited JSON on stdin/stdout
use async_trait::async_trait;
use pkgtxn_core::application::AgentSink;
use pkgtxn_core::domain::{Answer, PackageSet};
use pkgtxn_core::port::agent_wire::{self, WireRequest, WireSignal};
use pkgtxn_core::port::{AgentError, AgentNotice, PackageAgent};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Environment variables passed through to the worker
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL"];

/// SIGTERM grace period before SIGKILL
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SubprocessAgentConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Only these variables of the daemon's environment reach the worker
    pub env_allowlist: Vec<String>,
    pub graceful_timeout: Duration,
}

impl SubprocessAgentConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            graceful_timeout: GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

struct WorkerProcess {
    pid: u32,
    stdin: ChildStdin,
}

/// [`PackageAgent`] backed by a long-lived worker process.
///
/// The worker is spawned on first use and reused for later transactions.
/// Its appearance and exit are reported to the scheduler as owner
/// changes, with the process id as owner name.
pub struct SubprocessAgent {
    config: SubprocessAgentConfig,
    sink: AgentSink,
    worker: Arc<Mutex<Option<WorkerProcess>>>,
}

impl SubprocessAgent {
    /// # Example
    /// ```ignore
    /// let (handle, sink, inbox) = pkgtxn_core::application::channel();
    /// let agent = SubprocessAgent::new(
    ///     SubprocessAgentConfig::new("/usr/lib/pkgtxn/pkgtxn-worker", vec![]),
    ///     sink,
    /// );
    /// ```
    pub fn new(config: SubprocessAgentConfig, sink: AgentSink) -> Self {
        Self {
            config,
            sink,
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// PID of the running worker, if any
    pub async fn worker_pid(&self) -> Option<u32> {
        self.worker.lock().await.as_ref().map(|w| w.pid)
    }

    /// Stop the worker: close its stdin, then SIGTERM, then SIGKILL
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        let pid = worker.pid;
        drop(worker.stdin);

        info!(pid = %pid, "Stopping package worker");
        if let Err(e) = self.kill_graceful(pid).await {
            error!(pid = %pid, error = %e, "Failed to stop package worker");
        }
    }

    async fn send(&self, request: WireRequest) -> Result<(), AgentError> {
        let mut line =
            serde_json::to_string(&request).map_err(|e| AgentError::Transport(e.to_string()))?;
        line.push('\n');

        let mut guard = self.worker.lock().await;
        let worker = match guard.take() {
            Some(worker) => worker,
            None => self.spawn_worker()?,
        };
        let worker = guard.insert(worker);

        debug!(pid = %worker.pid, request = %line.trim_end(), "Sending request to worker");
        worker
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Transport(format!("write to worker {}: {}", worker.pid, e)))?;
        worker
            .stdin
            .flush()
            .await
            .map_err(|e| AgentError::Transport(format!("flush to worker {}: {}", worker.pid, e)))
    }

    fn spawn_worker(&self) -> Result<WorkerProcess, AgentError> {
        let env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| self.config.env_allowlist.contains(k))
            .collect();

        info!(
            command = %self.config.command,
            args = ?self.config.args,
            "Starting package worker"
        );

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::Unavailable(format!("spawn {}: {}", self.config.command, e))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| AgentError::Unavailable("worker exited during spawn".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Unavailable("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Unavailable("worker stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pid = %pid, "worker: {}", line);
                }
            });
        }

        tokio::spawn(read_signals(
            pid,
            child,
            stdout,
            self.sink.clone(),
            Arc::clone(&self.worker),
        ));

        info!(pid = %pid, "Package worker started");
        self.sink.notify(AgentNotice::OwnerChanged {
            old_owner: String::new(),
            new_owner: pid.to_string(),
        });
        Ok(WorkerProcess { pid, stdin })
    }

    /// Kill process with SIGTERM first, then SIGKILL if needed
    async fn kill_graceful(&self, pid: u32) -> Result<(), AgentError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let raw = i32::try_from(pid)
                .map_err(|_| AgentError::Transport(format!("pid out of range: {}", pid)))?;

            info!(pid = %pid, "Sending SIGTERM for graceful shutdown");
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                // Already gone
                debug!(pid = %pid, error = %e, "SIGTERM not delivered");
                return Ok(());
            }

            let deadline = tokio::time::Instant::now() + self.config.graceful_timeout;
            loop {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;

                if !is_alive(pid) {
                    info!(pid = %pid, "Worker exited after SIGTERM");
                    return Ok(());
                }

                if tokio::time::Instant::now() >= deadline {
                    warn!(pid = %pid, "Worker did not exit after SIGTERM, sending SIGKILL");
                    return kill(Pid::from_raw(raw), Signal::SIGKILL)
                        .map_err(|e| AgentError::Transport(format!("SIGKILL failed: {}", e)));
                }
            }
        }

        #[cfg(not(unix))]
        {
            // kill_on_drop ends the worker once its reader task drops the child
            debug!(pid = %pid, "Worker stdin closed");
            Ok(())
        }
    }
}

/// Forward decoded worker output until EOF, then report the worker gone
async fn read_signals(
    pid: u32,
    mut child: Child,
    stdout: ChildStdout,
    sink: AgentSink,
    worker: Arc<Mutex<Option<WorkerProcess>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Ok(notice) => {
                        if !sink.notify(notice) {
                            debug!(pid = %pid, "Scheduler gone, dropping worker output");
                        }
                    }
                    Err(e) => warn!(pid = %pid, line = %line, error = %e, "Malformed worker output dropped"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(pid = %pid, error = %e, "Failed to read worker output");
                break;
            }
        }
    }

    match child.wait().await {
        Ok(status) => info!(pid = %pid, status = %status, "Package worker exited"),
        Err(e) => error!(pid = %pid, error = %e, "Failed to reap package worker"),
    }

    {
        let mut slot = worker.lock().await;
        if slot.as_ref().is_some_and(|w| w.pid == pid) {
            *slot = None;
        }
    }

    sink.notify(AgentNotice::OwnerChanged {
        old_owner: pid.to_string(),
        new_owner: String::new(),
    });
}

fn parse_line(line: &str) -> Result<AgentNotice, String> {
    let signal: WireSignal = serde_json::from_str(line).map_err(|e| e.to_string())?;
    agent_wire::decode(signal)
        .map(AgentNotice::Signal)
        .map_err(|e| e.to_string())
}

/// Signal 0 checks if the process exists without signalling it
#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
        Err(_) => false,
    }
}

#[async_trait]
impl PackageAgent for SubprocessAgent {
    async fn commit_changes(&self, packages: &PackageSet) -> Result<(), AgentError> {
        self.send(WireRequest::commit_changes(packages)).await
    }

    async fn update_cache(&self) -> Result<(), AgentError> {
        self.send(WireRequest::UpdateCache).await
    }

    async fn cancel_download(&self) -> Result<(), AgentError> {
        // Nothing to cancel without a worker
        if self.worker_pid().await.is_none() {
            return Ok(());
        }
        self.send(WireRequest::CancelDownload).await
    }

    async fn answer_question(&self, answer: &Answer) -> Result<(), AgentError> {
        self.send(WireRequest::answer(answer)).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pkgtxn_core::application::{
        channel, shutdown_channel, ClientSession, Scheduler, SchedulerConfig, SchedulerHandle,
        ShutdownTrigger,
    };
    use pkgtxn_core::domain::{
        EventPayload, Outcome, PackageMode, Transaction, TransactionError, TransactionKind,
        TransactionState,
    };
    use pkgtxn_core::port::id_provider::mocks::SequentialIdProvider;
    use pkgtxn_core::port::store::mocks::InMemoryTransactionStore;
    use pkgtxn_core::port::time_provider::SystemTimeProvider;

    fn script_config(script: &str) -> SubprocessAgentConfig {
        let mut config =
            SubprocessAgentConfig::new("sh", vec!["-c".to_string(), script.to_string()]);
        config.graceful_timeout = Duration::from_millis(300);
        config
    }

    fn start(config: SubprocessAgentConfig) -> (SchedulerHandle, Arc<SubprocessAgent>, ShutdownTrigger) {
        let (handle, sink, inbox) = channel();
        let agent = Arc::new(SubprocessAgent::new(config, sink));
        let scheduler = Scheduler::new(
            inbox,
            SchedulerConfig::default(),
            agent.clone(),
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(SequentialIdProvider::new()),
            Arc::new(SystemTimeProvider),
        );
        let (trigger, listener) = shutdown_channel();
        tokio::spawn(scheduler.run(listener));
        (handle, agent, trigger)
    }

    async fn wait_terminal(handle: &SchedulerHandle, id: &str) -> Transaction {
        for _ in 0..100 {
            let txn = handle.transaction(id).await.unwrap().unwrap();
            if txn.is_terminal() {
                return txn;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("transaction {} did not finish", id);
    }

    fn install() -> PackageSet {
        PackageSet::with_mode(["pkgA"], PackageMode::Install).unwrap()
    }

    #[tokio::test]
    async fn test_worker_signals_drive_transaction() {
        let script = r#"
            while read -r request; do
                echo '{"signal":"workerStarted"}'
                echo 'not json'
                echo '{"signal":"workerEvent","code":5}'
                echo '{"signal":"commitProgress","message":"Unpacking pkgA","percent":50}'
                echo '{"signal":"workerFinished","success":true}'
            done
        "#;
        let (handle, agent, _trigger) = start(script_config(script));
        let client = ClientSession::open(handle.clone()).await.unwrap();

        let id = client.submit(TransactionKind::Install, install()).await.unwrap();
        let txn = wait_terminal(&handle, &id).await;
        assert_eq!(txn.state, TransactionState::Finished);

        let mut events = client.subscribe(&id).await.unwrap();
        let mut payloads = Vec::new();
        while let Some(event) = events.recv().await {
            payloads.push(event.payload);
        }
        assert_eq!(payloads.first(), Some(&EventPayload::Started));
        assert_eq!(payloads.last(), Some(&EventPayload::Finished(Outcome::Succeeded)));
        assert_eq!(payloads.len(), 4);

        // Worker is reused
        let pid = agent.worker_pid().await;
        assert!(pid.is_some());
        let second = client.submit(TransactionKind::Update, PackageSet::empty()).await.unwrap();
        assert_eq!(wait_terminal(&handle, &second).await.state, TransactionState::Finished);
        assert_eq!(agent.worker_pid().await, pid);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_exit_fails_with_agent_lost() {
        let (handle, _agent, _trigger) = start(script_config("read -r request; exit 3"));
        let client = ClientSession::open(handle.clone()).await.unwrap();

        let id = client.submit(TransactionKind::Install, install()).await.unwrap();
        let txn = wait_terminal(&handle, &id).await;
        assert_eq!(txn.state, TransactionState::Failed);
        assert_eq!(txn.error, Some(TransactionError::AgentLost));
    }

    #[tokio::test]
    async fn test_missing_worker_binary_fails_dispatch() {
        let config = SubprocessAgentConfig::new("/nonexistent/pkgtxn-worker", vec![]);
        let (handle, _agent, _trigger) = start(config);
        let client = ClientSession::open(handle.clone()).await.unwrap();

        let id = client.submit(TransactionKind::Install, install()).await.unwrap();
        let txn = wait_terminal(&handle, &id).await;
        assert_eq!(txn.error, Some(TransactionError::Init));
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (_handle, agent, _trigger) =
            start(script_config("trap '' TERM; while read -r request; do :; done"));
        agent.update_cache().await.unwrap();
        let pid = agent.worker_pid().await.unwrap();

        agent.shutdown().await;
        assert!(agent.worker_pid().await.is_none());

        let mut gone = false;
        for _ in 0..40 {
            if !is_alive(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "worker {} still alive", pid);
    }

    #[test]
    fn test_parse_line() {
        assert!(matches!(
            parse_line(r#"{"signal":"workerFinished","success":false}"#),
            Ok(AgentNotice::Signal(_))
        ));
        assert!(parse_line(r#"{"signal":"workerEvent","code":99}"#).is_err());
        assert!(parse_line("{").is_err());
    }
}
