//! Match Engine
//!
//! Resolves a normalized address (plus optional structured identifier) to at
//! most one canonical parcel. Tiers are tried in order, first hit wins:
//!
//! 1. exact_match: identifier equals a stored parcel number (confidence `exact`)
//! 2. high_confidence: normalized address equals a stored normalized address
//!    (confidence `high`)
//! 3. medium_confidence: trigram similarity ≥ `medium_floor`
//! 4. low_confidence: trigram similarity ≥ `low_floor`; never auto-applied
//! 5. no_match
//!
//! Candidates come from a scoped lookup (zip, city, county), never a full scan.
//! Scores within `tie_epsilon` of the best are tied; ties go to the narrower
//! scope, then the lowest parcel id. With `TiePolicy::Downgrade` a tied
//! winner is reported as low_confidence instead.

use parcelrec_common::config::{MatchSettings, TiePolicy};
use parcelrec_common::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::address_normalizer::{AddressNormalizer, NormalizedAddress};
use crate::models::{AddressMatch, MatchType};
use crate::storage::{CandidateScope, ParcelStore, ScopeLevel};

/// Candidate with its similarity to the source address
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub parcel_id: i64,
    /// Stored address as written in the parcel record
    pub address: String,
    pub scope: ScopeLevel,
    /// Trigram similarity in [0, 1]
    pub similarity: f64,
    /// Normalized forms are identical
    pub normalized_equal: bool,
}

pub struct MatchEngine {
    store: Arc<dyn ParcelStore>,
    settings: MatchSettings,
    normalizer: AddressNormalizer,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn ParcelStore>, settings: MatchSettings) -> Self {
        Self {
            store,
            settings,
            normalizer: AddressNormalizer::new(),
        }
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    /// Resolve one source record
    ///
    /// An empty candidate set is `no_match`, not an error. Storage errors
    /// propagate to the caller.
    pub async fn resolve(
        &self,
        address: Option<&NormalizedAddress>,
        identifier: Option<&str>,
        scope: &CandidateScope,
    ) -> Result<AddressMatch> {
        if let Some(id) = identifier.map(str::trim).filter(|id| !id.is_empty()) {
            if let Some(parcel) = self.store.parcel_by_identifier(id).await? {
                return Ok(AddressMatch {
                    parcel_id: Some(parcel.id),
                    matched_address: Some(parcel.address),
                    confidence: self.settings.exact,
                    match_type: MatchType::ExactMatch,
                    tie_count: 1,
                });
            }
            debug!(identifier = id, "Identifier not found, falling back to address match");
        }

        let Some(address) = address else {
            return Ok(AddressMatch::no_match(0.0));
        };

        let candidates = self
            .store
            .candidates_for_scope(scope, self.settings.max_candidates)
            .await?;
        if candidates.is_empty() {
            debug!(address = %address, "No candidates in scope");
            return Ok(AddressMatch::no_match(0.0));
        }

        let source = address.canonical();
        let source_trigrams = trigrams(&source);
        let scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .filter_map(|c| {
                let stored = match self.normalizer.normalize(&c.parcel.address) {
                    Ok(n) => n.canonical(),
                    Err(_) => {
                        warn!(parcel_id = c.parcel.id, "Stored parcel has an unusable address");
                        return None;
                    }
                };
                Some(ScoredCandidate {
                    parcel_id: c.parcel.id,
                    similarity: jaccard(&source_trigrams, &trigrams(&stored)),
                    normalized_equal: stored == source,
                    address: c.parcel.address,
                    scope: c.scope,
                })
            })
            .collect();

        let result = rank_candidates(&scored, &self.settings);
        debug!(
            address = %address,
            candidates = scored.len(),
            match_type = %result.match_type,
            confidence = result.confidence,
            tie_count = result.tie_count,
            "Resolved address"
        );
        Ok(result)
    }
}

/// Classify scored candidates into a single match result
pub fn rank_candidates(scored: &[ScoredCandidate], settings: &MatchSettings) -> AddressMatch {
    if scored.is_empty() {
        return AddressMatch::no_match(0.0);
    }

    let equal: Vec<&ScoredCandidate> = scored.iter().filter(|c| c.normalized_equal).collect();
    let (pool, match_type, confidence) = if !equal.is_empty() {
        (equal, MatchType::HighConfidence, None)
    } else {
        let best = scored
            .iter()
            .map(|c| c.similarity)
            .fold(0.0_f64, f64::max);
        let match_type = if best >= settings.medium_floor {
            MatchType::MediumConfidence
        } else if best >= settings.low_floor {
            MatchType::LowConfidence
        } else {
            return AddressMatch::no_match(best);
        };
        let tied = scored
            .iter()
            .filter(|c| best - c.similarity <= settings.tie_epsilon)
            .collect();
        (tied, match_type, Some(best))
    };

    // Deterministic winner: narrowest scope, then lowest parcel id
    let Some(winner) = pool.iter().min_by_key(|c| (c.scope, c.parcel_id)) else {
        return AddressMatch::no_match(0.0);
    };
    let tie_count = pool
        .iter()
        .map(|c| c.parcel_id)
        .collect::<HashSet<_>>()
        .len();

    // A downgraded tie reports the winner's similarity, never the high tier value
    let downgraded = tie_count > 1 && settings.tie_policy == TiePolicy::Downgrade;
    let (match_type, confidence) = if downgraded {
        (MatchType::LowConfidence, winner.similarity)
    } else {
        (match_type, confidence.map_or(settings.high, |_| winner.similarity))
    };

    AddressMatch {
        parcel_id: Some(winner.parcel_id),
        matched_address: Some(winner.address.clone()),
        confidence: confidence.clamp(0.0, 1.0),
        match_type,
        tie_count,
    }
}

/// Trigram set of a string: lowercase words padded with two leading and one
/// trailing space, non-alphanumerics treated as word breaks
pub fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();
    for word in s
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars().flat_map(char::to_lowercase))
            .chain(" ".chars())
            .collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

fn jaccard(a: &HashSet<[char; 3]>, b: &HashSet<[char; 3]>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Trigram similarity in [0, 1]: shared trigrams over all distinct trigrams
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    jaccard(&trigrams(a), &trigrams(b))
}
