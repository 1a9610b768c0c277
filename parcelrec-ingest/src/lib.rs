//! parcelrec-ingest library interface
//!
//! Reconciles FOIA source records against canonical parcel records: match
//! each record to at most one parcel, apply its field updates with a full
//! audit trail, and allow a completed import to be rolled back.

pub mod db;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;
pub mod workflow;

use parcelrec_common::config::TomlConfig;
use parcelrec_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::db::SqliteStore;
use crate::services::{ImportSessionManager, MatchEngine, ParcelLocks, RollbackController, UpdateApplier};
use crate::storage::{ParcelStore, SessionRepository};
use crate::utils::RetryPolicy;
use crate::workflow::ImportPipeline;

/// Wired set of ingest components sharing one store and event bus
#[derive(Clone)]
pub struct IngestContext {
    pub event_bus: EventBus,
    pub sessions: Arc<ImportSessionManager>,
    pub applier: Arc<UpdateApplier>,
    /// Per-parcel write locks shared by import and rollback
    pub locks: Arc<ParcelLocks>,
    pub matcher: Arc<MatchEngine>,
    pub pipeline: Arc<ImportPipeline>,
    pub rollback: Arc<RollbackController>,
}

impl IngestContext {
    /// Wire components over explicit storage implementations
    pub fn new(
        parcels: Arc<dyn ParcelStore>,
        repo: Arc<dyn SessionRepository>,
        config: &TomlConfig,
        event_bus: EventBus,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);
        let locks = ParcelLocks::new();

        let sessions = Arc::new(ImportSessionManager::new(repo, event_bus.clone(), retry.clone()));
        let matcher = Arc::new(MatchEngine::new(parcels.clone(), config.matching.clone()));
        let applier = Arc::new(UpdateApplier::new(
            parcels.clone(),
            locks.clone(),
            retry,
            config.workers.clone(),
        ));
        let pipeline = Arc::new(ImportPipeline::new(
            matcher.clone(),
            applier.clone(),
            sessions.clone(),
            event_bus.clone(),
            config.workers.concurrency,
        ));
        let rollback = Arc::new(RollbackController::new(
            parcels,
            applier.clone(),
            sessions.clone(),
            event_bus.clone(),
        ));

        Self {
            event_bus,
            sessions,
            applier,
            locks,
            matcher,
            pipeline,
            rollback,
        }
    }

    /// Wire components over the SQLite store
    pub fn from_pool(pool: SqlitePool, config: &TomlConfig, event_bus: EventBus) -> Self {
        let store = Arc::new(SqliteStore::new(pool));
        Self::new(store.clone(), store, config, event_bus)
    }
}
