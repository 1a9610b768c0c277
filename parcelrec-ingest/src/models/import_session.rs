//! Import session state machine
//!
//! uploading → processing → {completed | failed}; completed → rolled_back
//! (explicit operator action only). `failed` is reserved for errors that
//! happen before any record is processed.

use chrono::{DateTime, Utc};
use parcelrec_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, input accepted, nothing dispatched yet
    Uploading,
    /// Records are being (or may be resumed being) processed
    Processing,
    /// Every record reached an outcome
    Completed,
    /// Catastrophic error before any record was processed
    Failed,
    /// Effects reversed by the rollback controller
    RolledBack,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploading => "uploading",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::RolledBack
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    ///
    /// `completed` is terminal for import purposes; the only exit is an
    /// operator-requested rollback.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Uploading, SessionStatus::Processing)
                | (SessionStatus::Uploading, SessionStatus::Failed)
                | (SessionStatus::Processing, SessionStatus::Completed)
                | (SessionStatus::Processing, SessionStatus::Failed)
                | (SessionStatus::Completed, SessionStatus::RolledBack)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploading" => Ok(SessionStatus::Uploading),
            "processing" => Ok(SessionStatus::Processing),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "rolled_back" => Ok(SessionStatus::RolledBack),
            other => Err(Error::Internal(format!("Unknown session status: {}", other))),
        }
    }
}

/// Status change record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub session_id: Uuid,
    pub old_status: SessionStatus,
    pub new_status: SessionStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// Import session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: Uuid,
    /// Input file name as given by the operator
    pub filename: String,
    /// Distinct source records in the input
    pub total_records: u64,
    pub processed_records: u64,
    pub successful_updates: u64,
    /// Records that ended failed or skipped
    pub failed_updates: u64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only when the session is `failed`
    pub failure_reason: Option<String>,
    /// Audit entries that could not be restored by the last rollback
    pub rollback_failures: u64,
}

impl ImportSession {
    /// Create new session in `uploading`
    pub fn new(filename: impl Into<String>, total_records: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            total_records,
            processed_records: 0,
            successful_updates: 0,
            failed_updates: 0,
            status: SessionStatus::Uploading,
            created_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
            rollback_failures: 0,
        }
    }

    /// Transition to new status, rejecting moves the lifecycle forbids
    pub fn transition_to(&mut self, new_status: SessionStatus) -> Result<StatusTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let transition = StatusTransition {
            session_id: self.id,
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;

        // completed_at marks the end of import processing; a later rollback keeps it
        if matches!(new_status, SessionStatus::Completed | SessionStatus::Failed) {
            self.completed_at = Some(transition.transitioned_at);
        }

        Ok(transition)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn remaining_records(&self) -> u64 {
        self.total_records.saturating_sub(self.processed_records)
    }

    /// Percentage complete (0.0 - 100.0)
    pub fn progress_percentage(&self) -> f64 {
        if self.total_records == 0 {
            100.0
        } else {
            (self.processed_records as f64 / self.total_records as f64) * 100.0
        }
    }

    /// Counter invariants that must hold at every observable point
    ///
    /// Terminal sessions have counted every record. A `failed` session never
    /// processed any, so its total is zeroed when it fails.
    pub fn counters_consistent(&self) -> bool {
        self.processed_records <= self.total_records
            && self.successful_updates + self.failed_updates == self.processed_records
            && (!self.is_terminal() || self.processed_records == self.total_records)
    }
}
