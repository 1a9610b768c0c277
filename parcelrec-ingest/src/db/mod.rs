//! SQLite persistence
//!
//! Free functions per table, plus `SqliteStore`, which implements both
//! storage interfaces over one pool.

pub mod audit;
pub mod parcels;
pub mod sessions;
pub mod updates;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcelrec_common::{Error, FieldChanges, ParcelRecord, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::{AuditLogEntry, FoiaUpdate, ImportSession, SessionStatus, SessionSummary, UpdateStatus};
use crate::storage::{CandidateScope, ParcelStore, ScopedParcel, SessionRepository};

pub(crate) fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

/// SQLite-backed parcel store and session repository
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ParcelStore for SqliteStore {
    async fn candidates_for_scope(&self, scope: &CandidateScope, limit: usize) -> Result<Vec<ScopedParcel>> {
        parcels::candidates_for_scope(&self.pool, scope, limit).await
    }

    async fn parcel_by_identifier(&self, parcel_number: &str) -> Result<Option<ParcelRecord>> {
        parcels::find_by_identifier(&self.pool, parcel_number).await
    }

    async fn get_parcel_by_id(&self, id: i64) -> Result<ParcelRecord> {
        parcels::load_parcel(&self.pool, id).await
    }

    async fn write_parcel_and_audit(&self, id: i64, changes: &FieldChanges, entry: &AuditLogEntry) -> Result<i64> {
        parcels::write_parcel_and_audit(&self.pool, id, changes, entry).await
    }

    async fn audit_entries_for_session(&self, session_id: Uuid) -> Result<Vec<AuditLogEntry>> {
        audit::entries_for_session(&self.pool, session_id).await
    }
}

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn insert_session(&self, session: &ImportSession) -> Result<()> {
        sessions::insert_session(&self.pool, session).await
    }

    async fn load_session(&self, id: Uuid) -> Result<ImportSession> {
        sessions::load_session(&self.pool, id).await
    }

    async fn set_total_records(&self, id: Uuid, total_records: u64) -> Result<()> {
        sessions::set_total_records(&self.pool, id, total_records).await
    }

    async fn save_transition(&self, session: &ImportSession, expected: SessionStatus) -> Result<()> {
        sessions::save_transition(&self.pool, session, expected).await
    }

    async fn find_update(&self, session_id: Uuid, source_address: &str) -> Result<Option<FoiaUpdate>> {
        updates::find_update(&self.pool, session_id, source_address).await
    }

    async fn upsert_pending_update(&self, update: &FoiaUpdate) -> Result<FoiaUpdate> {
        updates::upsert_pending_update(&self.pool, update).await
    }

    async fn tally_outcome(&self, update: &FoiaUpdate) -> Result<Option<UpdateStatus>> {
        updates::tally_outcome(&self.pool, update).await
    }

    async fn tallied_sources(&self, session_id: Uuid) -> Result<HashSet<String>> {
        updates::tallied_sources(&self.pool, session_id).await
    }

    async fn updates_for_session(&self, session_id: Uuid) -> Result<Vec<FoiaUpdate>> {
        updates::updates_for_session(&self.pool, session_id).await
    }

    async fn session_summary(&self, session_id: Uuid) -> Result<SessionSummary> {
        updates::session_summary(&self.pool, session_id).await
    }
}
