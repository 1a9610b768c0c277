//! Address Normalizer
//!
//! Canonicalizes free-text street addresses so that equal addresses compare
//! equal as strings:
//! - uppercase, punctuation dropped, whitespace collapsed
//! - directionals and ordinal words abbreviated (NORTH → N, FIRST → 1ST)
//! - street suffix standardized to one abbreviation (STREET → ST), with
//!   single-typo correction for long suffix words (STRET → ST)
//! - unit/suite designators split into a secondary field (APT 2, STE 100)
//!
//! Every output token is a fixed point of the mappings, which makes
//! `normalize(normalize(x)) == normalize(x)`.

use parcelrec_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical address: street line plus optional unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub street: String,
    pub unit: Option<String>,
}

impl NormalizedAddress {
    /// Single-line canonical form
    pub fn canonical(&self) -> String {
        match &self.unit {
            Some(unit) => format!("{} {}", self.street, unit),
            None => self.street.clone(),
        }
    }

    /// Leading house number, when the street line starts with one
    pub fn street_number(&self) -> Option<&str> {
        self.street
            .split(' ')
            .next()
            .filter(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Stateless address canonicalizer
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressNormalizer;

impl AddressNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize raw address text
    ///
    /// # Errors
    /// `InvalidAddress` for empty or purely non-alphanumeric input.
    pub fn normalize(&self, raw: &str) -> Result<NormalizedAddress> {
        if !raw.chars().any(char::is_alphanumeric) {
            return Err(Error::InvalidAddress(raw.to_string()));
        }

        let tokens = tokenize(raw);
        if !tokens.iter().any(|t| t.chars().any(char::is_alphanumeric)) {
            return Err(Error::InvalidAddress(raw.to_string()));
        }

        let (street_tokens, unit) = split_unit(&tokens);
        let street = canonical_street(street_tokens);

        Ok(NormalizedAddress { street, unit })
    }
}

/// Uppercase, drop punctuation, give '#' its own token
fn tokenize(raw: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(raw.len() + 4);
    for c in raw.chars().flat_map(char::to_uppercase) {
        match c {
            '#' => cleaned.push_str(" # "),
            '\'' | '’' => {}
            '-' | '/' | '&' => cleaned.push(c),
            c if c.is_alphanumeric() => cleaned.push(c),
            _ => cleaned.push(' '),
        }
    }
    cleaned.split_whitespace().map(str::to_string).collect()
}

/// Canonical unit designator for a token, if it is one
fn unit_designator(token: &str) -> Option<&'static str> {
    match token {
        "APT" | "APARTMENT" => Some("APT"),
        "UNIT" | "#" => Some("UNIT"),
        "STE" | "SUITE" => Some("STE"),
        "RM" | "ROOM" => Some("RM"),
        "BLDG" | "BUILDING" => Some("BLDG"),
        "SPC" | "SPACE" => Some("SPC"),
        _ => None,
    }
}

/// Split at the first designator (not leading) that is followed by a value
fn split_unit(tokens: &[String]) -> (&[String], Option<String>) {
    for (i, token) in tokens.iter().enumerate().skip(1) {
        let Some(designator) = unit_designator(token) else {
            continue;
        };
        let rest: Vec<&str> = tokens[i + 1..]
            .iter()
            .map(String::as_str)
            .filter(|t| *t != "#")
            .map(|t| unit_designator(t).unwrap_or(t))
            .collect();
        if rest.is_empty() {
            continue;
        }
        return (&tokens[..i], Some(format!("{} {}", designator, rest.join(" "))));
    }
    (tokens, None)
}

fn directional(token: &str) -> Option<&'static str> {
    match token {
        "NORTH" | "N" => Some("N"),
        "SOUTH" | "S" => Some("S"),
        "EAST" | "E" => Some("E"),
        "WEST" | "W" => Some("W"),
        "NORTHEAST" | "NE" => Some("NE"),
        "NORTHWEST" | "NW" => Some("NW"),
        "SOUTHEAST" | "SE" => Some("SE"),
        "SOUTHWEST" | "SW" => Some("SW"),
        _ => None,
    }
}

fn ordinal(token: &str) -> Option<&'static str> {
    match token {
        "FIRST" => Some("1ST"),
        "SECOND" => Some("2ND"),
        "THIRD" => Some("3RD"),
        "FOURTH" => Some("4TH"),
        "FIFTH" => Some("5TH"),
        "SIXTH" => Some("6TH"),
        "SEVENTH" => Some("7TH"),
        "EIGHTH" => Some("8TH"),
        "NINTH" => Some("9TH"),
        "TENTH" => Some("10TH"),
        _ => None,
    }
}

fn street_suffix(token: &str) -> Option<&'static str> {
    match token {
        "STREET" | "STR" | "STRT" | "ST" => Some("ST"),
        "AVENUE" | "AVEN" | "AV" | "AVE" => Some("AVE"),
        "BOULEVARD" | "BOUL" | "BLV" | "BLVD" => Some("BLVD"),
        "DRIVE" | "DRV" | "DR" => Some("DR"),
        "ROAD" | "RD" => Some("RD"),
        "LANE" | "LN" => Some("LN"),
        "COURT" | "CT" => Some("CT"),
        "PLACE" | "PL" => Some("PL"),
        "CIRCLE" | "CIRC" | "CIR" => Some("CIR"),
        "TERRACE" | "TERR" | "TER" => Some("TER"),
        "PARKWAY" | "PKY" | "PKWY" => Some("PKWY"),
        "HIGHWAY" | "HWY" => Some("HWY"),
        "TRAIL" | "TRL" => Some("TRL"),
        "SQUARE" | "SQ" => Some("SQ"),
        "ALLEY" | "ALY" => Some("ALY"),
        "EXPRESSWAY" | "EXPY" => Some("EXPY"),
        "FREEWAY" | "FWY" => Some("FWY"),
        "CROSSING" | "XING" => Some("XING"),
        "HEIGHTS" | "HTS" => Some("HTS"),
        "PLAZA" | "PLZ" => Some("PLZ"),
        "CENTER" | "CTR" => Some("CTR"),
        "WAY" => Some("WAY"),
        "LOOP" => Some("LOOP"),
        _ => None,
    }
}

/// Long suffix words eligible for single-edit typo correction
const CORRECTABLE_SUFFIXES: [&str; 13] = [
    "STREET", "AVENUE", "BOULEVARD", "CIRCLE", "TERRACE", "PARKWAY", "HIGHWAY", "SQUARE",
    "EXPRESSWAY", "FREEWAY", "CROSSING", "HEIGHTS", "CENTER",
];

/// Suffix for a likely misspelling, when exactly one long suffix is one edit away
fn corrected_suffix(token: &str) -> Option<&'static str> {
    if token.len() < 5 || !token.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut hits = CORRECTABLE_SUFFIXES
        .iter()
        .filter(|word| strsim::damerau_levenshtein(token, word) == 1);
    match (hits.next(), hits.next()) {
        (Some(word), None) => street_suffix(word),
        _ => None,
    }
}

fn canonical_street(tokens: &[String]) -> String {
    let mut out: Vec<String> = tokens
        .iter()
        .enumerate()
        .map(|(i, t)| {
            if i == 0 {
                return t.clone();
            }
            directional(t)
                .or_else(|| ordinal(t))
                .map(str::to_string)
                .unwrap_or_else(|| t.clone())
        })
        .collect();

    // The suffix is the last token that is not a trailing directional
    let mut suffix_at = out.len().saturating_sub(1);
    while suffix_at > 1 && directional(&out[suffix_at]).is_some() {
        suffix_at -= 1;
    }
    if suffix_at >= 1 && directional(&out[suffix_at]).is_none() {
        let token = &out[suffix_at];
        if let Some(suffix) = street_suffix(token).or_else(|| corrected_suffix(token)) {
            out[suffix_at] = suffix.to_string();
        }
    }

    out.join(" ")
}

/// Convenience wrapper over `AddressNormalizer::normalize`
pub fn normalize(raw: &str) -> Result<NormalizedAddress> {
    AddressNormalizer.normalize(raw)
}
