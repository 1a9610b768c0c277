//! Rollback Controller
//!
//! Reverses a completed session: walks its update audit entries newest
//! first and restores each parcel's pre-change values. Restores are best
//! effort; failures are collected and reported, the rest still proceed.
//! Every restore is itself audited as a `rollback` entry.

use chrono::Utc;
use parcelrec_common::events::{EventBus, IngestEvent};
use parcelrec_common::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::session_manager::ImportSessionManager;
use super::update_applier::UpdateApplier;
use crate::models::{AuditOperation, SessionStatus};
use crate::storage::ParcelStore;

/// One audit entry that could not be restored
#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub audit_id: Option<i64>,
    pub parcel_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub session_id: Uuid,
    /// Entries whose parcel was written back
    pub restored: u64,
    /// Entries whose parcel already held the pre-change values
    pub unchanged: u64,
    pub failures: Vec<RollbackFailure>,
}

pub struct RollbackController {
    store: Arc<dyn ParcelStore>,
    applier: Arc<UpdateApplier>,
    sessions: Arc<ImportSessionManager>,
    event_bus: EventBus,
}

impl RollbackController {
    pub fn new(
        store: Arc<dyn ParcelStore>,
        applier: Arc<UpdateApplier>,
        sessions: Arc<ImportSessionManager>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            store,
            applier,
            sessions,
            event_bus,
        }
    }

    /// Roll back a completed session
    ///
    /// # Errors
    /// `InvalidTransition` unless the session is `completed`.
    pub async fn rollback(&self, session_id: Uuid) -> Result<RollbackReport> {
        let session = self.sessions.load(session_id).await?;
        if session.status != SessionStatus::Completed {
            return Err(Error::InvalidTransition {
                from: session.status.to_string(),
                to: SessionStatus::RolledBack.to_string(),
            });
        }

        let mut entries: Vec<_> = self
            .store
            .audit_entries_for_session(session_id)
            .await?
            .into_iter()
            .filter(|e| e.operation == AuditOperation::Update)
            .collect();
        // Newest commit first, so stacked changes to one parcel unwind in
        // order. Audit ids follow commit order; timestamps are taken before
        // the commit and can run backwards.
        entries.sort_by(|a, b| b.id.cmp(&a.id));

        info!(session_id = %session_id, entries = entries.len(), "Rolling back import session");

        let mut report = RollbackReport {
            session_id,
            ..RollbackReport::default()
        };
        for entry in &entries {
            match self.applier.restore(entry).await {
                Ok(true) => report.restored += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        audit_id = ?entry.id,
                        parcel_id = entry.record_id,
                        error = %e,
                        "Restore failed"
                    );
                    report.failures.push(RollbackFailure {
                        audit_id: entry.id,
                        parcel_id: entry.record_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let failures = report.failures.len() as u64;
        self.sessions.mark_rolled_back(session_id, failures).await?;
        self.event_bus.emit_lossy(IngestEvent::RollbackCompleted {
            session_id,
            restored: report.restored,
            failures,
            timestamp: Utc::now(),
        });

        info!(
            session_id = %session_id,
            restored = report.restored,
            unchanged = report.unchanged,
            failures,
            "Rollback finished"
        );
        Ok(report)
    }
}
