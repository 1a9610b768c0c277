//! Import Pipeline
//!
//! Drives one import session end to end:
//!
//! 1. **Upload**: the session opens in `uploading`; unparseable input fails
//!    it before any record is processed
//! 2. **Prepare**: assign each source record its key, drop duplicates (last
//!    occurrence wins)
//! 3. **Dispatch**: records go through a bounded worker pool; each is
//!    normalized, matched, persisted as a pending update, applied (auto tiers
//!    only) and counted exactly once
//! 4. **Finish**: finalize when every record is counted; otherwise the
//!    session stays `processing` and `resume` picks up the rest
//!
//! # Cancellation
//! The token is checked before each record starts. In-flight records run to
//! completion, nothing new starts, and the session is left resumable.

use futures::stream::{self, StreamExt};
use parcelrec_common::events::{EventBus, IngestEvent};
use parcelrec_common::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{FoiaUpdate, ImportSession, MatchType, SessionStatus, SourceRecord, UpdateStatus};
use crate::services::{AddressNormalizer, ImportSessionManager, MatchEngine, NormalizedAddress, UpdateApplier};
use crate::storage::CandidateScope;

/// Source record with its per-session key
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub key: String,
    pub record: SourceRecord,
}

/// Record whose outcome could not be counted in this run
#[derive(Debug, Clone, Serialize)]
pub struct RecordError {
    pub source_key: String,
    pub error: String,
}

/// Result of one `start` or `resume` run
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub session: ImportSession,
    /// Records started in this run
    pub dispatched: usize,
    /// Dispatch stopped early on the cancellation token
    pub cancelled: bool,
    pub errors: Vec<RecordError>,
}

enum RecordResult {
    Counted,
    NotDispatched,
    Error(RecordError),
}

/// Key every record and drop duplicate keys, keeping the last occurrence
pub fn prepare(records: Vec<SourceRecord>) -> Vec<PreparedRecord> {
    let keyed: Vec<PreparedRecord> = records
        .into_iter()
        .enumerate()
        .map(|(index, record)| PreparedRecord {
            key: record.source_key(index),
            record,
        })
        .collect();

    let last_index: HashMap<&str, usize> = keyed
        .iter()
        .enumerate()
        .map(|(i, p)| (p.key.as_str(), i))
        .collect();
    let keep: Vec<bool> = keyed
        .iter()
        .enumerate()
        .map(|(i, p)| last_index.get(p.key.as_str()) == Some(&i))
        .collect();

    keyed
        .into_iter()
        .zip(keep)
        .filter_map(|(p, keep)| keep.then_some(p))
        .collect()
}

pub struct ImportPipeline {
    normalizer: AddressNormalizer,
    matcher: Arc<MatchEngine>,
    applier: Arc<UpdateApplier>,
    sessions: Arc<ImportSessionManager>,
    event_bus: EventBus,
    concurrency: usize,
}

impl ImportPipeline {
    pub fn new(
        matcher: Arc<MatchEngine>,
        applier: Arc<UpdateApplier>,
        sessions: Arc<ImportSessionManager>,
        event_bus: EventBus,
        concurrency: usize,
    ) -> Self {
        Self {
            normalizer: AddressNormalizer::new(),
            matcher,
            applier,
            sessions,
            event_bus,
            concurrency: concurrency.max(1),
        }
    }

    /// Open an `uploading` session for an arriving file
    ///
    /// The record count is set once the input has been parsed.
    pub async fn open(&self, filename: &str) -> Result<ImportSession> {
        self.sessions.create_session(filename, 0).await
    }

    /// Parse the uploaded contents of an open session and process them
    ///
    /// Input that cannot be parsed fails the session before any record is
    /// processed; the outcome then carries the failed session.
    pub async fn ingest(
        &self,
        session_id: Uuid,
        contents: &str,
        cancel_token: CancellationToken,
    ) -> Result<ImportOutcome> {
        match SourceRecord::parse_input(contents) {
            Ok(records) => self.process_upload(session_id, records, cancel_token).await,
            Err(e) => {
                let session = self.sessions.fail(session_id, &e.to_string()).await?;
                Ok(ImportOutcome {
                    session,
                    dispatched: 0,
                    cancelled: false,
                    errors: Vec::new(),
                })
            }
        }
    }

    /// Create a session for already parsed `records` and process them
    pub async fn start(
        &self,
        filename: &str,
        records: Vec<SourceRecord>,
        cancel_token: CancellationToken,
    ) -> Result<ImportOutcome> {
        let session = self.open(filename).await?;
        self.process_upload(session.id, records, cancel_token).await
    }

    async fn process_upload(
        &self,
        session_id: Uuid,
        records: Vec<SourceRecord>,
        cancel_token: CancellationToken,
    ) -> Result<ImportOutcome> {
        let prepared = prepare(records);
        self.sessions
            .set_total_records(session_id, prepared.len() as u64)
            .await?;
        self.sessions.begin_processing(session_id).await?;

        self.run(session_id, prepared, cancel_token).await
    }

    /// Continue a `processing` session from the same input
    ///
    /// Records whose outcome is already counted are not dispatched again.
    pub async fn resume(
        &self,
        session_id: Uuid,
        records: Vec<SourceRecord>,
        cancel_token: CancellationToken,
    ) -> Result<ImportOutcome> {
        let session = self.sessions.load(session_id).await?;
        if session.status != SessionStatus::Processing {
            return Err(Error::InvalidInput(format!(
                "session {} is {}; only processing sessions can be resumed",
                session_id, session.status
            )));
        }

        let prepared = prepare(records);
        if prepared.len() as u64 != session.total_records {
            return Err(Error::InvalidInput(format!(
                "input has {} distinct records but session {} expects {}",
                prepared.len(),
                session_id,
                session.total_records
            )));
        }

        let done = self.sessions.repository().tallied_sources(session_id).await?;
        let remaining: Vec<PreparedRecord> = prepared
            .into_iter()
            .filter(|p| !done.contains(&p.key))
            .collect();

        info!(
            session_id = %session_id,
            already_counted = done.len(),
            remaining = remaining.len(),
            "Resuming import session"
        );
        self.run(session_id, remaining, cancel_token).await
    }

    async fn run(
        &self,
        session_id: Uuid,
        records: Vec<PreparedRecord>,
        cancel_token: CancellationToken,
    ) -> Result<ImportOutcome> {
        let results: Vec<RecordResult> = stream::iter(records)
            .map(|prepared| {
                let cancel_token = cancel_token.clone();
                async move {
                    if cancel_token.is_cancelled() {
                        return RecordResult::NotDispatched;
                    }
                    match self.process_record(session_id, &prepared).await {
                        Ok(()) => RecordResult::Counted,
                        Err(e) => {
                            warn!(
                                session_id = %session_id,
                                source_key = %prepared.key,
                                error = %e,
                                "Record not counted"
                            );
                            RecordResult::Error(RecordError {
                                source_key: prepared.key,
                                error: e.to_string(),
                            })
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut dispatched = 0;
        let mut skipped_by_cancel = 0;
        let mut errors = Vec::new();
        for result in results {
            match result {
                RecordResult::Counted => dispatched += 1,
                RecordResult::NotDispatched => skipped_by_cancel += 1,
                RecordResult::Error(e) => {
                    dispatched += 1;
                    errors.push(e);
                }
            }
        }

        let mut session = self.sessions.load(session_id).await?;
        let cancelled = skipped_by_cancel > 0;

        if session.processed_records == session.total_records {
            session = self.sessions.finalize(session_id).await?;
        } else if cancelled {
            info!(
                session_id = %session_id,
                processed_records = session.processed_records,
                total_records = session.total_records,
                "Import cancelled; session left resumable"
            );
            self.event_bus.emit_lossy(IngestEvent::SessionCancelled {
                session_id,
                processed_records: session.processed_records,
                total_records: session.total_records,
                timestamp: chrono::Utc::now(),
            });
        } else {
            warn!(
                session_id = %session_id,
                uncounted = session.remaining_records(),
                "Import run ended with uncounted records; resume to retry them"
            );
        }

        Ok(ImportOutcome {
            session,
            dispatched,
            cancelled,
            errors,
        })
    }

    /// Carry one record to a counted outcome
    ///
    /// Storage errors while matching become a `failed` outcome. An error
    /// returned here means the outcome itself could not be counted; the
    /// record is retried on resume.
    async fn process_record(&self, session_id: Uuid, prepared: &PreparedRecord) -> Result<()> {
        let repo = self.sessions.repository();
        let record = &prepared.record;

        // A previous run may have written the parcel but stopped before counting
        if let Some(existing) = repo.find_update(session_id, &prepared.key).await? {
            if existing.tallied {
                return Ok(());
            }
            if existing.status == UpdateStatus::Applied {
                self.sessions.record_outcome(&existing).await?;
                return Ok(());
            }
        }

        let raw_address = record.address.as_deref().unwrap_or_default();
        let normalized = match self.normalizer.normalize(raw_address) {
            Ok(n) => Some(n),
            Err(e) if record.identifier().is_none() => {
                debug!(source_key = %prepared.key, error = %e, "Rejecting record");
                let rejected = FoiaUpdate::rejected(session_id, prepared.key.clone(), e.to_string());
                self.sessions.record_outcome(&rejected).await?;
                return Ok(());
            }
            Err(_) => None,
        };

        let mut stored = match self.match_and_store(session_id, prepared, normalized.as_ref()).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    source_key = %prepared.key,
                    error = %e,
                    "Matching failed; recording failed outcome"
                );
                let failed = FoiaUpdate::failed_before_apply(
                    session_id,
                    prepared.key.clone(),
                    record.fields.clone(),
                    e.to_string(),
                );
                self.sessions.record_outcome(&failed).await?;
                return Ok(());
            }
        };

        let outcome = if stored.status == UpdateStatus::Applied {
            stored
        } else if !stored.match_type.is_auto_applicable() {
            let reason = match stored.match_type {
                MatchType::NoMatch => "no matching parcel",
                _ => "low confidence match; needs review",
            };
            stored.mark_skipped(reason);
            stored
        } else if stored.field_updates.is_empty() {
            stored.mark_skipped("no field updates in source record");
            stored
        } else {
            self.applier.apply(&stored).await
        };

        self.sessions.record_outcome(&outcome).await?;
        Ok(())
    }

    /// Resolve the record's parcel and persist the pending update
    async fn match_and_store(
        &self,
        session_id: Uuid,
        prepared: &PreparedRecord,
        normalized: Option<&NormalizedAddress>,
    ) -> Result<FoiaUpdate> {
        let record = &prepared.record;
        let scope = CandidateScope::from_record(record, normalized.and_then(|n| n.street_number()));
        let address_match = self
            .matcher
            .resolve(normalized, record.identifier(), &scope)
            .await?;

        let pending = FoiaUpdate::pending(
            session_id,
            prepared.key.clone(),
            &address_match,
            record.fields.clone(),
        );
        self.sessions.repository().upsert_pending_update(&pending).await
    }
}
