//! Shared fixtures for ingest integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parcelrec_common::config::TomlConfig;
use parcelrec_common::db::init_database;
use parcelrec_common::events::EventBus;
use parcelrec_common::{Error, FieldChanges, FieldValue, ParcelField, ParcelRecord, Result};
use parcelrec_ingest::db::{parcels, SqliteStore};
use parcelrec_ingest::models::{
    AuditLogEntry, FoiaUpdate, ImportSession, SessionStatus, SessionSummary, SourceRecord, UpdateStatus,
};
use parcelrec_ingest::storage::{CandidateScope, ParcelStore, ScopedParcel, SessionRepository};
use parcelrec_ingest::IngestContext;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const CITY: &str = "SPRINGFIELD";
pub const COUNTY: &str = "SANGAMON";

/// Temporary database; the directory lives as long as this value
pub struct TestDb {
    _dir: TempDir,
    pub pool: SqlitePool,
}

impl TestDb {
    pub fn store(&self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::new(self.pool.clone()))
    }
}

pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("parcelrec.db")).await.unwrap();
    TestDb { _dir: dir, pool }
}

pub fn parcel(id: i64, address: &str, zip: &str) -> ParcelRecord {
    let mut parcel = ParcelRecord::new(id, address);
    parcel.zip = Some(zip.to_string());
    parcel.city = Some(CITY.to_string());
    parcel.county = Some(COUNTY.to_string());
    parcel
}

pub async fn seed(pool: &SqlitePool, records: &[ParcelRecord]) {
    for record in records {
        parcels::save_parcel(pool, record).await.unwrap();
    }
}

pub fn source(address: &str, zip: &str, fields: &[(ParcelField, FieldValue)]) -> SourceRecord {
    SourceRecord {
        address: Some(address.to_string()),
        zip: Some(zip.to_string()),
        fields: fields.iter().cloned().collect::<FieldChanges>(),
        ..SourceRecord::default()
    }
}

pub fn text(s: &str) -> FieldValue {
    FieldValue::Text(s.to_string())
}

/// Defaults with millisecond backoff so retries do not slow tests down
pub fn test_config(concurrency: usize) -> TomlConfig {
    let mut config = TomlConfig::default();
    config.workers.concurrency = concurrency;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config
}

pub fn context(db: &TestDb, config: &TomlConfig) -> IngestContext {
    IngestContext::from_pool(db.pool.clone(), config, EventBus::new(1000))
}

/// Current values of every updatable field
pub fn field_values(parcel: &ParcelRecord) -> FieldChanges {
    parcel.values_of(ParcelField::ALL.iter())
}

// ========================================
// Fault-injecting wrappers
// ========================================

/// Session repository that cancels a token once `after` outcomes are counted
pub struct CancelAfterTallies {
    inner: SqliteStore,
    token: CancellationToken,
    after: usize,
    counted: AtomicUsize,
}

impl CancelAfterTallies {
    pub fn new(inner: SqliteStore, token: CancellationToken, after: usize) -> Self {
        Self {
            inner,
            token,
            after,
            counted: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionRepository for CancelAfterTallies {
    async fn insert_session(&self, session: &ImportSession) -> Result<()> {
        self.inner.insert_session(session).await
    }

    async fn load_session(&self, id: Uuid) -> Result<ImportSession> {
        self.inner.load_session(id).await
    }

    async fn set_total_records(&self, id: Uuid, total_records: u64) -> Result<()> {
        self.inner.set_total_records(id, total_records).await
    }

    async fn save_transition(&self, session: &ImportSession, expected: SessionStatus) -> Result<()> {
        self.inner.save_transition(session, expected).await
    }

    async fn find_update(&self, session_id: Uuid, source_address: &str) -> Result<Option<FoiaUpdate>> {
        self.inner.find_update(session_id, source_address).await
    }

    async fn upsert_pending_update(&self, update: &FoiaUpdate) -> Result<FoiaUpdate> {
        self.inner.upsert_pending_update(update).await
    }

    async fn tally_outcome(&self, update: &FoiaUpdate) -> Result<Option<UpdateStatus>> {
        let result = self.inner.tally_outcome(update).await?;
        if result.is_some() && self.counted.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(result)
    }

    async fn tallied_sources(&self, session_id: Uuid) -> Result<HashSet<String>> {
        self.inner.tallied_sources(session_id).await
    }

    async fn updates_for_session(&self, session_id: Uuid) -> Result<Vec<FoiaUpdate>> {
        self.inner.updates_for_session(session_id).await
    }

    async fn session_summary(&self, session_id: Uuid) -> Result<SessionSummary> {
        self.inner.session_summary(session_id).await
    }
}

/// Parcel store whose writes are delayed or rejected for chosen parcels,
/// whose candidate reads fail outright, or whose audit timestamps run
/// backwards
pub struct FaultyStore {
    inner: SqliteStore,
    write_delay: Duration,
    fail_parcels: HashSet<i64>,
    fail_reads: bool,
    reverse_audit_clock: bool,
}

impl FaultyStore {
    pub fn slow(inner: SqliteStore, write_delay: Duration) -> Self {
        Self {
            inner,
            write_delay,
            fail_parcels: HashSet::new(),
            fail_reads: false,
            reverse_audit_clock: false,
        }
    }

    pub fn failing(inner: SqliteStore, fail_parcels: &[i64]) -> Self {
        Self {
            inner,
            write_delay: Duration::ZERO,
            fail_parcels: fail_parcels.iter().copied().collect(),
            fail_reads: false,
            reverse_audit_clock: false,
        }
    }

    pub fn unreadable(inner: SqliteStore) -> Self {
        Self {
            inner,
            write_delay: Duration::ZERO,
            fail_parcels: HashSet::new(),
            fail_reads: true,
            reverse_audit_clock: false,
        }
    }

    /// Audit entries come back with their timestamps in reverse commit order
    pub fn skewed_clock(inner: SqliteStore) -> Self {
        Self {
            inner,
            write_delay: Duration::ZERO,
            fail_parcels: HashSet::new(),
            fail_reads: false,
            reverse_audit_clock: true,
        }
    }
}

#[async_trait]
impl ParcelStore for FaultyStore {
    async fn candidates_for_scope(&self, scope: &CandidateScope, limit: usize) -> Result<Vec<ScopedParcel>> {
        if self.fail_reads {
            return Err(Error::StorageFailure("injected read failure".to_string()));
        }
        self.inner.candidates_for_scope(scope, limit).await
    }

    async fn parcel_by_identifier(&self, parcel_number: &str) -> Result<Option<ParcelRecord>> {
        self.inner.parcel_by_identifier(parcel_number).await
    }

    async fn get_parcel_by_id(&self, id: i64) -> Result<ParcelRecord> {
        self.inner.get_parcel_by_id(id).await
    }

    async fn write_parcel_and_audit(&self, id: i64, changes: &FieldChanges, entry: &AuditLogEntry) -> Result<i64> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.fail_parcels.contains(&id) {
            return Err(Error::StorageFailure(format!("injected write failure for parcel {}", id)));
        }
        self.inner.write_parcel_and_audit(id, changes, entry).await
    }

    async fn audit_entries_for_session(&self, session_id: Uuid) -> Result<Vec<AuditLogEntry>> {
        let mut entries = self.inner.audit_entries_for_session(session_id).await?;
        if self.reverse_audit_clock {
            let mut stamps: Vec<_> = entries.iter().map(|e| e.timestamp).collect();
            stamps.reverse();
            for (entry, stamp) in entries.iter_mut().zip(stamps) {
                entry.timestamp = stamp;
            }
        }
        Ok(entries)
    }
}

/// Context over a faulty parcel store and the real session repository
pub fn faulty_context(db: &TestDb, store: FaultyStore, config: &TomlConfig) -> IngestContext {
    IngestContext::new(Arc::new(store), db.store(), config, EventBus::new(1000))
}
