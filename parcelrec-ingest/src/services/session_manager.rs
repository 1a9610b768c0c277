//! Import session lifecycle
//!
//! Owns every session status change and the only path by which session
//! counters move (`record_outcome`). Status changes are compare-and-set in
//! storage, so concurrent operators cannot both win a transition.

use chrono::Utc;
use parcelrec_common::events::{EventBus, IngestEvent};
use parcelrec_common::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{FoiaUpdate, ImportSession, SessionStatus, SessionSummary, UpdateStatus};
use crate::storage::SessionRepository;
use crate::utils::RetryPolicy;

pub struct ImportSessionManager {
    repo: Arc<dyn SessionRepository>,
    event_bus: EventBus,
    retry: RetryPolicy,
}

impl ImportSessionManager {
    pub fn new(repo: Arc<dyn SessionRepository>, event_bus: EventBus, retry: RetryPolicy) -> Self {
        Self { repo, event_bus, retry }
    }

    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.repo
    }

    /// Create a session in `uploading` for `total_records` distinct source records
    pub async fn create_session(&self, filename: &str, total_records: u64) -> Result<ImportSession> {
        let session = ImportSession::new(filename, total_records);
        self.repo.insert_session(&session).await?;
        info!(
            session_id = %session.id,
            filename,
            total_records,
            "Import session created"
        );
        Ok(session)
    }

    /// Set the distinct record count once the uploaded input has been parsed
    pub async fn set_total_records(&self, session_id: Uuid, total_records: u64) -> Result<()> {
        self.repo.set_total_records(session_id, total_records).await?;
        info!(session_id = %session_id, total_records, "Import input accepted");
        Ok(())
    }

    /// uploading → processing
    pub async fn begin_processing(&self, session_id: Uuid) -> Result<ImportSession> {
        let mut session = self.repo.load_session(session_id).await?;
        let transition = session.transition_to(SessionStatus::Processing)?;
        self.repo.save_transition(&session, transition.old_status).await?;

        info!(session_id = %session_id, total_records = session.total_records, "Import session processing");
        self.event_bus.emit_lossy(IngestEvent::SessionStarted {
            session_id,
            filename: session.filename.clone(),
            total_records: session.total_records,
            timestamp: transition.transitioned_at,
        });
        Ok(session)
    }

    /// Count one record's final outcome
    ///
    /// Idempotent per (session, source_address): a repeated call returns
    /// `None` and changes nothing. Transient storage contention is retried.
    pub async fn record_outcome(&self, update: &FoiaUpdate) -> Result<Option<UpdateStatus>> {
        let counted = self
            .retry
            .run("tally_outcome", || self.repo.tally_outcome(update))
            .await?;

        let Some(status) = counted else {
            return Ok(None);
        };

        match self.repo.load_session(update.import_session_id).await {
            Ok(session) => self.event_bus.emit_lossy(IngestEvent::RecordProcessed {
                session_id: session.id,
                source_address: update.source_address.clone(),
                match_type: update.match_type.to_string(),
                status: status.to_string(),
                processed_records: session.processed_records,
                total_records: session.total_records,
                timestamp: Utc::now(),
            }),
            Err(e) => warn!(
                session_id = %update.import_session_id,
                error = %e,
                "Outcome counted but session reload failed; progress event dropped"
            ),
        }
        Ok(Some(status))
    }

    /// processing → completed, once every record has been counted
    pub async fn finalize(&self, session_id: Uuid) -> Result<ImportSession> {
        let mut session = self.repo.load_session(session_id).await?;
        if session.status == SessionStatus::Processing && session.processed_records != session.total_records {
            return Err(Error::InvalidInput(format!(
                "session {} has {} of {} records processed",
                session_id, session.processed_records, session.total_records
            )));
        }
        let transition = session.transition_to(SessionStatus::Completed)?;
        self.repo.save_transition(&session, transition.old_status).await?;

        info!(
            session_id = %session_id,
            successful_updates = session.successful_updates,
            failed_updates = session.failed_updates,
            "Import session completed"
        );
        self.event_bus.emit_lossy(IngestEvent::SessionCompleted {
            session_id,
            successful_updates: session.successful_updates,
            failed_updates: session.failed_updates,
            timestamp: transition.transitioned_at,
        });
        Ok(session)
    }

    /// Mark a session failed before any record was processed
    ///
    /// A session with counted records cannot fail; it stays `processing` and
    /// is resumed instead. A failed session counts no records, so its
    /// `total_records` becomes 0.
    pub async fn fail(&self, session_id: Uuid, reason: &str) -> Result<ImportSession> {
        let mut session = self.repo.load_session(session_id).await?;
        if session.processed_records > 0 {
            return Err(Error::InvalidInput(format!(
                "session {} already processed {} records and cannot fail",
                session_id, session.processed_records
            )));
        }
        let transition = session.transition_to(SessionStatus::Failed)?;
        session.failure_reason = Some(reason.to_string());
        session.total_records = 0;
        self.repo.save_transition(&session, transition.old_status).await?;

        warn!(session_id = %session_id, reason, "Import session failed");
        self.event_bus.emit_lossy(IngestEvent::SessionFailed {
            session_id,
            reason: reason.to_string(),
            timestamp: transition.transitioned_at,
        });
        Ok(session)
    }

    /// completed → rolled_back, recording how many restores failed
    pub async fn mark_rolled_back(&self, session_id: Uuid, rollback_failures: u64) -> Result<ImportSession> {
        let mut session = self.repo.load_session(session_id).await?;
        let transition = session.transition_to(SessionStatus::RolledBack)?;
        session.rollback_failures = rollback_failures;
        self.repo.save_transition(&session, transition.old_status).await?;

        info!(session_id = %session_id, rollback_failures, "Import session rolled back");
        Ok(session)
    }

    pub async fn load(&self, session_id: Uuid) -> Result<ImportSession> {
        self.repo.load_session(session_id).await
    }

    pub async fn summary(&self, session_id: Uuid) -> Result<SessionSummary> {
        self.repo.session_summary(session_id).await
    }
}
