// Agent Wire Contract
// Integer codes + loose argument maps on the wire, closed typed variants inside

use crate::domain::{Answer, PackageMode, PackageSet, PhaseCode, Question, TransactionError};
use crate::port::package_agent::AgentSignal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Numeric codes used by the agent
pub mod codes {
    // Worker events
    pub const CACHE_UPDATE_STARTED: i32 = 1;
    pub const CACHE_UPDATE_FINISHED: i32 = 2;
    pub const PACKAGE_DOWNLOAD_STARTED: i32 = 3;
    pub const PACKAGE_DOWNLOAD_FINISHED: i32 = 4;
    pub const COMMIT_CHANGES_STARTED: i32 = 5;
    pub const COMMIT_CHANGES_FINISHED: i32 = 6;

    // Errors
    pub const UNKNOWN_ERROR: i32 = -1;
    pub const INIT_ERROR: i32 = 1;
    pub const LOCK_ERROR: i32 = 2;
    pub const DISK_SPACE_ERROR: i32 = 3;
    pub const FETCH_ERROR: i32 = 4;
    pub const COMMIT_ERROR: i32 = 5;
    pub const AUTH_ERROR: i32 = 6;
    pub const WORKER_DISAPPEARED: i32 = 7;
    pub const UNTRUSTED_ERROR: i32 = 8;

    // Questions
    pub const MEDIA_CHANGE: i32 = 1;
    pub const INSTALL_UNTRUSTED: i32 = 2;
}

/// Argument keys used in error/question/answer maps
pub mod keys {
    pub const FAILED_ITEM: &str = "FailedItem";
    pub const ERROR_TEXT: &str = "ErrorText";
    pub const DIRECTORY_STRING: &str = "DirectoryString";
    pub const UNTRUSTED_ITEMS: &str = "UntrustedItems";
    pub const MEDIA: &str = "Media";
    pub const DRIVE: &str = "Drive";
    pub const INSTALL_UNTRUSTED: &str = "InstallUntrusted";
    pub const MEDIA_CHANGED: &str = "MediaChanged";
}

/// Download ETAs at or beyond two weeks are treated as unknown
const MAX_ETA_SECONDS: i64 = 14 * 24 * 60 * 60;

/// Signal as the agent writes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "camelCase")]
pub enum WireSignal {
    WorkerStarted,
    WorkerEvent {
        code: i32,
    },
    DownloadProgress {
        percent: i32,
        speed: i64,
        eta: i64,
    },
    CommitProgress {
        message: String,
        percent: i32,
    },
    QuestionOccurred {
        code: i32,
        #[serde(default)]
        args: Map<String, Value>,
    },
    ErrorOccurred {
        code: i32,
        #[serde(default)]
        args: Map<String, Value>,
    },
    WorkerFinished {
        success: bool,
    },
}

/// Request as the agent reads it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WireRequest {
    CommitChanges {
        packages: BTreeMap<String, PackageMode>,
    },
    UpdateCache,
    CancelDownload,
    AnswerWorkerQuestion {
        response: Map<String, Value>,
    },
}

/// Malformed agent payload. Logged and dropped, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown worker event code: {0}")]
    UnknownEventCode(i32),

    #[error("Unknown question code: {0}")]
    UnknownQuestionCode(i32),

    #[error("Progress percent out of range: {0}")]
    PercentOutOfRange(i32),

    #[error("Argument {key} has the wrong type")]
    BadArgument { key: &'static str },
}

impl WireRequest {
    pub fn commit_changes(packages: &PackageSet) -> Self {
        WireRequest::CommitChanges {
            packages: packages.as_map().clone(),
        }
    }

    pub fn answer(answer: &Answer) -> Self {
        WireRequest::AnswerWorkerQuestion {
            response: encode_answer(answer),
        }
    }
}

/// Decode a wire signal into its typed form
pub fn decode(signal: WireSignal) -> Result<AgentSignal, WireError> {
    match signal {
        WireSignal::WorkerStarted => Ok(AgentSignal::WorkerStarted),
        WireSignal::WorkerEvent { code } => decode_event(code).map(AgentSignal::WorkerEvent),
        WireSignal::DownloadProgress {
            percent,
            speed,
            eta,
        } => Ok(AgentSignal::DownloadProgress {
            percent: decode_percent(percent)?,
            speed_bytes_per_sec: u64::try_from(speed).ok(),
            eta_seconds: (eta > 0 && eta < MAX_ETA_SECONDS).then_some(eta as u64),
        }),
        WireSignal::CommitProgress { message, percent } => Ok(AgentSignal::CommitProgress {
            message,
            percent: decode_percent(percent)?,
        }),
        WireSignal::QuestionOccurred { code, args } => {
            decode_question(code, &args).map(AgentSignal::QuestionOccurred)
        }
        WireSignal::ErrorOccurred { code, args } => {
            decode_error(code, &args).map(AgentSignal::ErrorOccurred)
        }
        WireSignal::WorkerFinished { success } => Ok(AgentSignal::WorkerFinished { success }),
    }
}

/// Encode an answer as the agent's response map
pub fn encode_answer(answer: &Answer) -> Map<String, Value> {
    let mut response = Map::new();
    match answer {
        Answer::InstallUntrusted { install_untrusted } => {
            response.insert(keys::INSTALL_UNTRUSTED.to_string(), Value::Bool(*install_untrusted));
        }
        Answer::MediaChange { media_changed } => {
            response.insert(keys::MEDIA_CHANGED.to_string(), Value::Bool(*media_changed));
        }
    }
    response
}

fn decode_event(code: i32) -> Result<PhaseCode, WireError> {
    match code {
        codes::CACHE_UPDATE_STARTED => Ok(PhaseCode::CacheUpdateStarted),
        codes::CACHE_UPDATE_FINISHED => Ok(PhaseCode::CacheUpdateFinished),
        codes::PACKAGE_DOWNLOAD_STARTED => Ok(PhaseCode::PackageDownloadStarted),
        codes::PACKAGE_DOWNLOAD_FINISHED => Ok(PhaseCode::PackageDownloadFinished),
        codes::COMMIT_CHANGES_STARTED => Ok(PhaseCode::CommitChangesStarted),
        codes::COMMIT_CHANGES_FINISHED => Ok(PhaseCode::CommitChangesFinished),
        other => Err(WireError::UnknownEventCode(other)),
    }
}

fn decode_percent(percent: i32) -> Result<u8, WireError> {
    u8::try_from(percent)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or(WireError::PercentOutOfRange(percent))
}

fn decode_question(code: i32, args: &Map<String, Value>) -> Result<Question, WireError> {
    match code {
        codes::INSTALL_UNTRUSTED => Ok(Question::InstallUntrusted {
            untrusted_items: list_arg(args, keys::UNTRUSTED_ITEMS)?,
        }),
        codes::MEDIA_CHANGE => Ok(Question::MediaChange {
            media: string_arg(args, keys::MEDIA)?,
            drive: string_arg(args, keys::DRIVE)?,
        }),
        other => Err(WireError::UnknownQuestionCode(other)),
    }
}

fn decode_error(code: i32, args: &Map<String, Value>) -> Result<TransactionError, WireError> {
    let err = match code {
        codes::INIT_ERROR => TransactionError::Init,
        codes::LOCK_ERROR => TransactionError::Lock,
        codes::DISK_SPACE_ERROR => TransactionError::DiskSpace {
            directory: string_arg(args, keys::DIRECTORY_STRING)?,
        },
        codes::FETCH_ERROR => TransactionError::Fetch {
            failed_item: string_arg(args, keys::FAILED_ITEM)?,
            error_text: string_arg(args, keys::ERROR_TEXT)?,
        },
        codes::COMMIT_ERROR => TransactionError::Commit {
            failed_item: string_arg(args, keys::FAILED_ITEM)?,
            error_text: string_arg(args, keys::ERROR_TEXT)?,
        },
        codes::AUTH_ERROR => TransactionError::Auth,
        codes::WORKER_DISAPPEARED => TransactionError::AgentLost,
        codes::UNTRUSTED_ERROR => TransactionError::Untrusted {
            untrusted_items: list_arg(args, keys::UNTRUSTED_ITEMS)?,
        },
        // An error is still an error even if we cannot classify it
        other => TransactionError::Unknown { code: other },
    };
    Ok(err)
}

// Missing keys decode as empty values; present keys must have the right type.
fn string_arg(args: &Map<String, Value>, key: &'static str) -> Result<String, WireError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(WireError::BadArgument { key }),
    }
}

fn list_arg(args: &Map<String, Value>, key: &'static str) -> Result<Vec<String>, WireError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or(WireError::BadArgument { key })
            })
            .collect(),
        Some(_) => Err(WireError::BadArgument { key }),
    }
}
