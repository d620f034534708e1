//! Daemon configuration from `PKGTXN_*` environment variables

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

const DEFAULT_DB_PATH: &str = "~/.pkgtxn/history.db";
const DEFAULT_RPC_HOST: &str = "127.0.0.1";
const DEFAULT_RPC_PORT: u16 = 9631;
const DEFAULT_AGENT_COMMAND: &str = "/usr/lib/pkgtxn/pkgtxn-worker";
const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub history_retention_days: u32,
    pub log_format: LogFormat,
    /// Daily rolling log files go here when set
    pub log_dir: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let expand = |raw: String| PathBuf::from(shellexpand::tilde(&raw).into_owned());

        let db_path = expand(get("PKGTXN_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()));

        let rpc_port = match get("PKGTXN_RPC_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("PKGTXN_RPC_PORT is not a port: {}", raw))?,
            None => DEFAULT_RPC_PORT,
        };

        let history_retention_days = match get("PKGTXN_HISTORY_RETENTION_DAYS") {
            Some(raw) => raw.parse().with_context(|| {
                format!("PKGTXN_HISTORY_RETENTION_DAYS is not a day count: {}", raw)
            })?,
            None => DEFAULT_RETENTION_DAYS,
        };

        let log_format = match get("PKGTXN_LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => bail!("PKGTXN_LOG_FORMAT must be pretty or json, got {}", other),
        };

        let agent_command = get("PKGTXN_AGENT_COMMAND")
            .map(|raw| shellexpand::tilde(&raw).into_owned())
            .unwrap_or_else(|| DEFAULT_AGENT_COMMAND.to_string());

        Ok(Self {
            db_path,
            rpc_host: get("PKGTXN_RPC_HOST").unwrap_or_else(|| DEFAULT_RPC_HOST.to_string()),
            rpc_port,
            agent_command,
            agent_args: get("PKGTXN_AGENT_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            history_retention_days,
            log_format,
            log_dir: get("PKGTXN_LOG_DIR").map(expand),
        })
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.db_path.display())
    }
}
