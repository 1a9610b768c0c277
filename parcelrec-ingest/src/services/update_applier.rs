//! Update Applier
//!
//! Applies one matched FOIA update to its parcel: lock the parcel, diff the
//! requested values against the current record, then write the changed
//! fields together with their audit entry in a single storage transaction.
//! A retry after a successful write is detected through the update's stored
//! status.
//!
//! `apply` never returns an error. Every failure becomes a `failed` outcome
//! with its message, so one bad record cannot stop the session.

use chrono::{DateTime, Utc};
use parcelrec_common::config::WorkerSettings;
use parcelrec_common::{FieldChanges, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use super::parcel_locks::ParcelLocks;
use crate::models::{AuditLogEntry, FoiaUpdate};
use crate::storage::ParcelStore;
use crate::utils::RetryPolicy;

/// Error message recorded when the apply step exceeds its time bound
pub const TIMEOUT_MESSAGE: &str = "timeout";
/// Message recorded when the parcel already holds every requested value
pub const NO_CHANGES_MESSAGE: &str = "no field changes";

enum WriteResult {
    Written { audit_id: i64, at: DateTime<Utc> },
    Unchanged,
}

pub struct UpdateApplier {
    store: Arc<dyn ParcelStore>,
    locks: Arc<ParcelLocks>,
    retry: RetryPolicy,
    workers: WorkerSettings,
}

impl UpdateApplier {
    pub fn new(
        store: Arc<dyn ParcelStore>,
        locks: Arc<ParcelLocks>,
        retry: RetryPolicy,
        workers: WorkerSettings,
    ) -> Self {
        Self {
            store,
            locks,
            retry,
            workers,
        }
    }

    /// Apply `update` and return it with its final status
    pub async fn apply(&self, update: &FoiaUpdate) -> FoiaUpdate {
        let mut outcome = update.clone();
        let Some(parcel_id) = update.parcel_id else {
            outcome.mark_skipped("no matched parcel");
            return outcome;
        };

        let attempt = self
            .retry
            .run("apply_update", || self.write_once(parcel_id, update));

        match tokio::time::timeout(self.workers.apply_timeout(), attempt).await {
            Ok(Ok(WriteResult::Written { audit_id, at })) => {
                debug!(
                    update_id = %update.id,
                    parcel_id,
                    audit_id,
                    "Update applied"
                );
                outcome.mark_applied(at);
            }
            Ok(Ok(WriteResult::Unchanged)) => outcome.mark_skipped(NO_CHANGES_MESSAGE),
            Ok(Err(e)) => {
                warn!(update_id = %update.id, parcel_id, error = %e, "Update failed");
                outcome.mark_failed(e.to_string());
            }
            Err(_) => {
                warn!(
                    update_id = %update.id,
                    parcel_id,
                    timeout_ms = self.workers.apply_timeout_ms,
                    "Update timed out"
                );
                outcome.mark_failed(TIMEOUT_MESSAGE);
            }
        }
        outcome
    }

    async fn write_once(&self, parcel_id: i64, update: &FoiaUpdate) -> Result<WriteResult> {
        let _guard = self.locks.acquire(parcel_id, self.workers.lock_timeout()).await?;

        let parcel = self.store.get_parcel_by_id(parcel_id).await?;
        let changes = parcel.diff(&update.field_updates)?;
        if changes.is_empty() {
            return Ok(WriteResult::Unchanged);
        }

        let entry = AuditLogEntry::for_update(update.import_session_id, update.id, &parcel, &changes)?;
        let audit_id = self.store.write_parcel_and_audit(parcel_id, &changes, &entry).await?;
        Ok(WriteResult::Written {
            audit_id,
            at: entry.timestamp,
        })
    }

    /// Put back the pre-change values recorded in an update audit entry
    ///
    /// Only the fields the entry changed are touched, and their snapshot
    /// values are written back exactly as recorded. A parcel that already
    /// holds those values is left alone. Returns whether a write happened.
    pub async fn restore(&self, entry: &AuditLogEntry) -> Result<bool> {
        let values = entry.restore_values()?;
        let values = &values;
        self.retry
            .run("restore_parcel", move || async move {
                let _guard = self
                    .locks
                    .acquire(entry.record_id, self.workers.lock_timeout())
                    .await?;

                let parcel = self.store.get_parcel_by_id(entry.record_id).await?;
                let changes: FieldChanges = parcel.raw_diff(values);
                if changes.is_empty() {
                    return Ok(false);
                }

                let rollback = AuditLogEntry::for_rollback(entry.session_id, &parcel, &changes)?;
                self.store
                    .write_parcel_and_audit(entry.record_id, &changes, &rollback)
                    .await?;
                Ok(true)
            })
            .await
    }
}
