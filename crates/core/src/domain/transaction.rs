// Transaction Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::failure::TransactionError;
use crate::domain::package::PackageSet;
use crate::domain::question::Question;
use serde::{Deserialize, Serialize};

/// Transaction ID (UUID v4 in production)
pub type TransactionId = String;

/// Client session ID
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Install,
    Remove,
    Upgrade,
    /// Refresh package metadata; carries no packages
    Update,
}

/// Top-level transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Added but not confirmed; does not compete for execution
    Proposed,
    /// Confirmed and queued
    Pending,
    Active,
    Finished,
    Failed,
    Cancelled,
}

/// Sub-phase of an Active transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Promoted, agent still winding down the previous transaction
    Waiting,
    /// Handed to the agent, start not yet confirmed
    Authorizing,
    Downloading,
    /// Mutating the package database; uninterruptible
    Committing,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Finished | TransactionState::Failed | TransactionState::Cancelled
        )
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Install => write!(f, "INSTALL"),
            TransactionKind::Remove => write!(f, "REMOVE"),
            TransactionKind::Upgrade => write!(f, "UPGRADE"),
            TransactionKind::Update => write!(f, "UPDATE"),
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSTALL" => Ok(TransactionKind::Install),
            "REMOVE" => Ok(TransactionKind::Remove),
            "UPGRADE" => Ok(TransactionKind::Upgrade),
            "UPDATE" => Ok(TransactionKind::Update),
            other => Err(DomainError::ValidationError(format!(
                "unknown transaction kind: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Proposed => write!(f, "PROPOSED"),
            TransactionState::Pending => write!(f, "PENDING"),
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Finished => write!(f, "FINISHED"),
            TransactionState::Failed => write!(f, "FAILED"),
            TransactionState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for TransactionState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PROPOSED" => Ok(TransactionState::Proposed),
            "PENDING" => Ok(TransactionState::Pending),
            "ACTIVE" => Ok(TransactionState::Active),
            "FINISHED" => Ok(TransactionState::Finished),
            "FAILED" => Ok(TransactionState::Failed),
            "CANCELLED" => Ok(TransactionState::Cancelled),
            other => Err(DomainError::ValidationError(format!(
                "unknown transaction state: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Waiting => write!(f, "WAITING"),
            Phase::Authorizing => write!(f, "AUTHORIZING"),
            Phase::Downloading => write!(f, "DOWNLOADING"),
            Phase::Committing => write!(f, "COMMITTING"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WAITING" => Ok(Phase::Waiting),
            "AUTHORIZING" => Ok(Phase::Authorizing),
            "DOWNLOADING" => Ok(Phase::Downloading),
            "COMMITTING" => Ok(Phase::Committing),
            other => Err(DomainError::ValidationError(format!(
                "unknown phase: {}",
                other
            ))),
        }
    }
}

/// Transaction Entity
///
/// Not serializable: `owner` authorizes cancel and answer, so clients only
/// ever see a [`TransactionView`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    packages: PackageSet,
    pub owner: SessionId,

    pub state: TransactionState,
    pub phase: Option<Phase>,
    pub progress_percent: u8,
    pub status_message: Option<String>,
    pub pending_question: Option<Question>,
    pub error: Option<TransactionError>,

    pub created_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Client-facing copy of a transaction, without the owning session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub packages: PackageSet,
    pub state: TransactionState,
    pub phase: Option<Phase>,
    pub progress_percent: u8,
    pub status_message: Option<String>,
    pub pending_question: Option<Question>,
    pub error: Option<TransactionError>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl From<&Transaction> for TransactionView {
    fn from(txn: &Transaction) -> Self {
        Self {
            id: txn.id.clone(),
            kind: txn.kind,
            packages: txn.packages.clone(),
            state: txn.state,
            phase: txn.phase,
            progress_percent: txn.progress_percent,
            status_message: txn.status_message.clone(),
            pending_question: txn.pending_question.clone(),
            error: txn.error.clone(),
            created_at: txn.created_at,
            started_at: txn.started_at,
            finished_at: txn.finished_at,
        }
    }
}

impl From<Transaction> for TransactionView {
    fn from(txn: Transaction) -> Self {
        Self::from(&txn)
    }
}

impl Transaction {
    /// Create a new, unconfirmed transaction
    ///
    /// # Arguments
    ///
    /// * `id` - Unique transaction ID (injected, not generated)
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    /// * `owner` - Session that requested the transaction
    /// * `kind` - Requested operation
    /// * `packages` - Packages and their modes; must be empty for `Update`
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        owner: impl Into<String>,
        kind: TransactionKind,
        packages: PackageSet,
    ) -> Result<Self> {
        match (kind, packages.is_empty()) {
            (TransactionKind::Update, false) => {
                return Err(DomainError::ValidationError(
                    "cache update does not take packages".to_string(),
                ))
            }
            (TransactionKind::Update, true) => {}
            (_, true) => {
                return Err(DomainError::ValidationError(format!(
                    "{} transaction needs at least one package",
                    kind
                )))
            }
            (_, false) => {}
        }

        Ok(Self {
            id: id.into(),
            kind,
            packages,
            owner: owner.into(),
            state: TransactionState::Proposed,
            phase: None,
            progress_percent: 0,
            status_message: None,
            pending_question: None,
            error: None,
            created_at,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn packages(&self) -> &PackageSet {
        &self.packages
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Proposed -> Pending
    pub fn confirm(&mut self) -> Result<()> {
        self.transition(TransactionState::Proposed, TransactionState::Pending)
    }

    /// Pending -> Active (phase starts at Waiting)
    pub fn activate(&mut self, now_millis: i64) -> Result<()> {
        self.transition(TransactionState::Pending, TransactionState::Active)?;
        self.phase = Some(Phase::Waiting);
        self.progress_percent = 0;
        self.started_at = Some(now_millis);
        Ok(())
    }

    /// Move to a new sub-phase. Progress restarts at zero.
    ///
    /// Returns false if already in `phase`.
    pub fn enter_phase(&mut self, phase: Phase) -> Result<bool> {
        self.require_active("phase change")?;
        if self.phase == Some(phase) {
            return Ok(false);
        }
        self.phase = Some(phase);
        self.progress_percent = 0;
        self.status_message = None;
        Ok(true)
    }

    /// Record progress within the current phase.
    ///
    /// Values above 100 are clamped. A value lower than the current one is
    /// ignored and reported as `false`.
    pub fn record_progress(&mut self, percent: u8) -> Result<bool> {
        self.require_active("progress")?;
        let percent = percent.min(100);
        if percent < self.progress_percent {
            return Ok(false);
        }
        self.progress_percent = percent;
        Ok(true)
    }

    /// Active -> Finished
    pub fn finish(&mut self, now_millis: i64) -> Result<()> {
        self.transition(TransactionState::Active, TransactionState::Finished)?;
        self.progress_percent = 100;
        self.pending_question = None;
        self.finished_at = Some(now_millis);
        Ok(())
    }

    /// Any non-terminal state -> Failed. Partial progress is kept.
    pub fn fail(&mut self, now_millis: i64, error: TransactionError) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid(TransactionState::Failed));
        }
        self.state = TransactionState::Failed;
        self.error = Some(error);
        self.pending_question = None;
        self.finished_at = Some(now_millis);
        Ok(())
    }

    /// Any non-terminal state -> Cancelled
    pub fn cancel(&mut self, now_millis: i64) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid(TransactionState::Cancelled));
        }
        self.state = TransactionState::Cancelled;
        self.pending_question = None;
        self.finished_at = Some(now_millis);
        Ok(())
    }

    fn transition(&mut self, from: TransactionState, to: TransactionState) -> Result<()> {
        if self.state != from {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    fn require_active(&self, what: &str) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: what.to_string(),
            });
        }
        Ok(())
    }

    fn invalid(&self, to: TransactionState) -> DomainError {
        DomainError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}
