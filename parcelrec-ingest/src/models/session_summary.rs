//! Operator-facing session summary

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ImportSession, MatchType, UpdateStatus};

/// A record needing operator attention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub source_address: String,
    pub match_type: MatchType,
    pub match_confidence: f64,
    pub matched_address: Option<String>,
    pub status: UpdateStatus,
    pub error_message: Option<String>,
}

/// Session counters plus a breakdown of its updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: ImportSession,
    pub by_status: BTreeMap<UpdateStatus, u64>,
    pub by_match_type: BTreeMap<MatchType, u64>,
    /// Low-confidence matches awaiting manual review
    pub needs_review: Vec<ReviewItem>,
    /// Updates that ended failed (storage errors, timeouts, conflicts)
    pub failures: Vec<ReviewItem>,
}

impl SessionSummary {
    pub fn count_status(&self, status: UpdateStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn count_match_type(&self, match_type: MatchType) -> u64 {
        self.by_match_type.get(&match_type).copied().unwrap_or(0)
    }
}
