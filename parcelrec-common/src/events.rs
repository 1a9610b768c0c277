//! Event system for parcel reconciliation
//!
//! Provides the ingest event definitions and an in-process EventBus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Ingest progress and lifecycle events
///
/// Statuses and match types are carried as their stored string form so that
/// subscribers do not need the ingest crate's model types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// Session moved to processing
    SessionStarted {
        session_id: Uuid,
        filename: String,
        total_records: u64,
        timestamp: DateTime<Utc>,
    },

    /// One record reached its final outcome
    RecordProcessed {
        session_id: Uuid,
        source_address: String,
        /// exact_match, high_confidence, ... no_match
        match_type: String,
        /// applied, failed or skipped
        status: String,
        processed_records: u64,
        total_records: u64,
        timestamp: DateTime<Utc>,
    },

    /// Dispatch stopped before all records were processed
    ///
    /// The session stays in processing and can be resumed.
    SessionCancelled {
        session_id: Uuid,
        processed_records: u64,
        total_records: u64,
        timestamp: DateTime<Utc>,
    },

    SessionCompleted {
        session_id: Uuid,
        successful_updates: u64,
        failed_updates: u64,
        timestamp: DateTime<Utc>,
    },

    SessionFailed {
        session_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    RollbackCompleted {
        session_id: Uuid,
        restored: u64,
        failures: u64,
        timestamp: DateTime<Utc>,
    },
}

impl IngestEvent {
    /// Session the event belongs to
    pub fn session_id(&self) -> Uuid {
        match self {
            IngestEvent::SessionStarted { session_id, .. }
            | IngestEvent::RecordProcessed { session_id, .. }
            | IngestEvent::SessionCancelled { session_id, .. }
            | IngestEvent::SessionCompleted { session_id, .. }
            | IngestEvent::SessionFailed { session_id, .. }
            | IngestEvent::RollbackCompleted { session_id, .. } => *session_id,
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use parcelrec_common::events::{EventBus, IngestEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(IngestEvent::SessionFailed {
///     session_id: uuid::Uuid::new_v4(),
///     reason: "unreadable input".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered per subscriber before the
    /// oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
