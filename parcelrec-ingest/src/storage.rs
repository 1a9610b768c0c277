//! Storage interfaces consumed by the ingest components
//!
//! Components receive these as `Arc<dyn ParcelStore>` / `Arc<dyn SessionRepository>`.
//! `crate::db::SqliteStore` implements both; tests wrap it to inject faults.

use async_trait::async_trait;
use parcelrec_common::{FieldChanges, ParcelRecord, Result};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::{
    AuditLogEntry, FoiaUpdate, ImportSession, SessionStatus, SessionSummary, SourceRecord,
    UpdateStatus,
};

/// Geographic filter for candidate lookup
///
/// At least one of zip, city or county must be set, otherwise there are no
/// candidates. `street_number` only orders candidates inside the scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateScope {
    pub zip: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub street_number: Option<String>,
}

impl CandidateScope {
    pub fn from_record(record: &SourceRecord, street_number: Option<&str>) -> Self {
        Self {
            zip: record.zip.clone(),
            city: record.city.clone(),
            county: record.county.clone(),
            street_number: street_number.map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.zip.is_none() && self.city.is_none() && self.county.is_none()
    }
}

/// Narrowest scope a candidate satisfied; orders narrow before wide
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeLevel {
    Zip,
    City,
    County,
}

impl ScopeLevel {
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => ScopeLevel::Zip,
            1 => ScopeLevel::City,
            _ => ScopeLevel::County,
        }
    }
}

/// Candidate parcel tagged with the scope it was found in
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedParcel {
    pub parcel: ParcelRecord,
    pub scope: ScopeLevel,
}

/// Canonical parcel storage
#[async_trait]
pub trait ParcelStore: Send + Sync {
    /// Parcels in the given scope, narrowest scope first, at most `limit`
    async fn candidates_for_scope(&self, scope: &CandidateScope, limit: usize) -> Result<Vec<ScopedParcel>>;

    /// Parcel whose structured identifier equals `parcel_number` exactly
    async fn parcel_by_identifier(&self, parcel_number: &str) -> Result<Option<ParcelRecord>>;

    /// `NotFound` when the id does not exist
    async fn get_parcel_by_id(&self, id: i64) -> Result<ParcelRecord>;

    /// Apply `changes` to parcel `id` and append `entry`, atomically
    ///
    /// Values are stored exactly as given, without canonicalization.
    ///
    /// When the entry names a FOIA update, that update is stamped `applied`
    /// in the same unit. Returns the audit entry id.
    async fn write_parcel_and_audit(&self, id: i64, changes: &FieldChanges, entry: &AuditLogEntry) -> Result<i64>;

    /// All audit entries written under a session, oldest first
    async fn audit_entries_for_session(&self, session_id: Uuid) -> Result<Vec<AuditLogEntry>>;
}

/// Session and pending-update persistence
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert_session(&self, session: &ImportSession) -> Result<()>;

    /// `NotFound` when the session does not exist
    async fn load_session(&self, id: Uuid) -> Result<ImportSession>;

    /// Record how many distinct source records an uploading session holds
    ///
    /// `InvalidTransition` once the session has left `uploading`.
    async fn set_total_records(&self, id: Uuid, total_records: u64) -> Result<()>;

    /// Persist status and lifecycle fields if the stored status is still `expected`
    ///
    /// Counters are owned by `tally_outcome` and are not written here, except
    /// that a session becoming `failed` has its `total_records` zeroed.
    async fn save_transition(&self, session: &ImportSession, expected: SessionStatus) -> Result<()>;

    async fn find_update(&self, session_id: Uuid, source_address: &str) -> Result<Option<FoiaUpdate>>;

    /// Insert or refresh the pending update for (session, source_address)
    ///
    /// Rows that are already tallied or applied are left untouched. Returns the
    /// stored row, whose id may differ from `update.id`.
    async fn upsert_pending_update(&self, update: &FoiaUpdate) -> Result<FoiaUpdate>;

    /// Record the final outcome of an update and bump session counters, atomically
    ///
    /// Returns the counted status, or `None` when the pair was already tallied.
    /// A stored `applied` status wins over the status carried by `update`.
    async fn tally_outcome(&self, update: &FoiaUpdate) -> Result<Option<UpdateStatus>>;

    /// Source keys whose outcome has been counted
    async fn tallied_sources(&self, session_id: Uuid) -> Result<HashSet<String>>;

    async fn updates_for_session(&self, session_id: Uuid) -> Result<Vec<FoiaUpdate>>;

    async fn session_summary(&self, session_id: Uuid) -> Result<SessionSummary>;
}
