//! Pending-update records and match results

use chrono::{DateTime, Utc};
use parcelrec_common::{Error, FieldChanges, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Confidence tier of an address match
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Structured identifier equals a stored identifier
    ExactMatch,
    /// Normalized address equals a stored normalized address
    HighConfidence,
    /// Similarity at or above the medium floor
    MediumConfidence,
    /// Similarity at or above the low floor; manual review only
    LowConfidence,
    NoMatch,
}

impl MatchType {
    pub const ALL: [MatchType; 5] = [
        MatchType::ExactMatch,
        MatchType::HighConfidence,
        MatchType::MediumConfidence,
        MatchType::LowConfidence,
        MatchType::NoMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::ExactMatch => "exact_match",
            MatchType::HighConfidence => "high_confidence",
            MatchType::MediumConfidence => "medium_confidence",
            MatchType::LowConfidence => "low_confidence",
            MatchType::NoMatch => "no_match",
        }
    }

    /// Tiers whose updates are applied without review
    pub fn is_auto_applicable(&self) -> bool {
        matches!(
            self,
            MatchType::ExactMatch | MatchType::HighConfidence | MatchType::MediumConfidence
        )
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MatchType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Internal(format!("Unknown match type: {}", s)))
    }
}

/// Outcome status of a pending update
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Pending,
    Applied,
    Failed,
    Skipped,
}

impl UpdateStatus {
    pub const ALL: [UpdateStatus; 4] = [
        UpdateStatus::Pending,
        UpdateStatus::Applied,
        UpdateStatus::Failed,
        UpdateStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::Applied => "applied",
            UpdateStatus::Failed => "failed",
            UpdateStatus::Skipped => "skipped",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, UpdateStatus::Pending)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        UpdateStatus::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Internal(format!("Unknown update status: {}", s)))
    }
}

/// Match engine result for one source record
///
/// Transient: its fields are copied into the FOIA update that records it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressMatch {
    pub parcel_id: Option<i64>,
    pub matched_address: Option<String>,
    /// In [0, 1]; for `no_match` this is the best similarity seen
    pub confidence: f64,
    pub match_type: MatchType,
    /// Candidates sharing the top score (1 when the winner was unique)
    pub tie_count: usize,
}

impl AddressMatch {
    pub fn no_match(best_score: f64) -> Self {
        Self {
            parcel_id: None,
            matched_address: None,
            confidence: best_score.clamp(0.0, 1.0),
            match_type: MatchType::NoMatch,
            tie_count: 0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.parcel_id.is_some() && self.match_type != MatchType::NoMatch
    }
}

/// FOIA update: one source record's match and its requested field changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoiaUpdate {
    pub id: Uuid,
    pub import_session_id: Uuid,
    /// Source key of the record; unique within the session
    pub source_address: String,
    pub parcel_id: Option<i64>,
    pub matched_address: Option<String>,
    pub match_confidence: f64,
    pub match_type: MatchType,
    pub field_updates: FieldChanges,
    pub status: UpdateStatus,
    pub error_message: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    /// Whether the outcome has been counted on the session
    pub tallied: bool,
    pub created_at: DateTime<Utc>,
}

impl FoiaUpdate {
    /// New pending update from a match result
    pub fn pending(
        import_session_id: Uuid,
        source_address: impl Into<String>,
        address_match: &AddressMatch,
        field_updates: FieldChanges,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            import_session_id,
            source_address: source_address.into(),
            parcel_id: address_match.parcel_id,
            matched_address: address_match.matched_address.clone(),
            match_confidence: address_match.confidence.clamp(0.0, 1.0),
            match_type: address_match.match_type,
            field_updates,
            status: UpdateStatus::Pending,
            error_message: None,
            applied_at: None,
            tallied: false,
            created_at: Utc::now(),
        }
    }

    /// Update for a record that never reached matching (unparseable address)
    pub fn rejected(import_session_id: Uuid, source_address: impl Into<String>, reason: String) -> Self {
        let mut update = Self::pending(
            import_session_id,
            source_address,
            &AddressMatch::no_match(0.0),
            FieldChanges::new(),
        );
        update.status = UpdateStatus::Skipped;
        update.error_message = Some(reason);
        update
    }

    /// Update for a record whose matching or persistence hit a storage error
    pub fn failed_before_apply(
        import_session_id: Uuid,
        source_address: impl Into<String>,
        field_updates: FieldChanges,
        reason: String,
    ) -> Self {
        let mut update = Self::pending(
            import_session_id,
            source_address,
            &AddressMatch::no_match(0.0),
            field_updates,
        );
        update.status = UpdateStatus::Failed;
        update.error_message = Some(reason);
        update
    }

    pub fn mark_applied(&mut self, at: DateTime<Utc>) {
        self.status = UpdateStatus::Applied;
        self.applied_at = Some(at);
        self.error_message = None;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = UpdateStatus::Failed;
        self.error_message = Some(message.into());
    }

    pub fn mark_skipped(&mut self, message: impl Into<String>) {
        self.status = UpdateStatus::Skipped;
        self.error_message = Some(message.into());
    }

    /// Counts toward `successful_updates` (otherwise `failed_updates`)
    pub fn counts_as_success(&self) -> bool {
        self.status == UpdateStatus::Applied
    }
}
