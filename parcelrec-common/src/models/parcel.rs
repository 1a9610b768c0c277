//! Canonical parcel record and its updatable attributes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Tolerance when comparing stored and incoming numeric values
const NUMERIC_TOLERANCE: f64 = 1e-9;

/// By-right zoning status from disclosure extracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZonedByRight {
    Yes,
    No,
    SpecialExemption,
}

impl ZonedByRight {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZonedByRight::Yes => "yes",
            ZonedByRight::No => "no",
            ZonedByRight::SpecialExemption => "special_exemption",
        }
    }

    /// Lenient parse of source spellings ("Yes", "N", "Special Exemption")
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match key.as_str() {
            "yes" | "y" | "true" => Some(ZonedByRight::Yes),
            "no" | "n" | "false" => Some(ZonedByRight::No),
            "special_exemption" | "special" | "exemption" => Some(ZonedByRight::SpecialExemption),
            _ => None,
        }
    }
}

/// Parcel attributes an import may change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParcelField {
    OwnerName,
    PropertyValue,
    LotSize,
    Latitude,
    Longitude,
    ZonedByRight,
    OccupancyClass,
    FireSprinklers,
}

impl ParcelField {
    pub const ALL: [ParcelField; 8] = [
        ParcelField::OwnerName,
        ParcelField::PropertyValue,
        ParcelField::LotSize,
        ParcelField::Latitude,
        ParcelField::Longitude,
        ParcelField::ZonedByRight,
        ParcelField::OccupancyClass,
        ParcelField::FireSprinklers,
    ];

    /// Column name in the `parcels` table
    pub fn as_str(&self) -> &'static str {
        match self {
            ParcelField::OwnerName => "owner_name",
            ParcelField::PropertyValue => "property_value",
            ParcelField::LotSize => "lot_size",
            ParcelField::Latitude => "latitude",
            ParcelField::Longitude => "longitude",
            ParcelField::ZonedByRight => "zoned_by_right",
            ParcelField::OccupancyClass => "occupancy_class",
            ParcelField::FireSprinklers => "fire_sprinklers",
        }
    }

    /// Convert a raw source value into the typed form stored for this field
    ///
    /// Empty text means "clear the value". Numbers may carry currency
    /// symbols and thousands separators ("$1,250,000").
    pub fn canonicalize(&self, value: &FieldValue) -> Result<FieldValue> {
        let invalid = |what: &str| {
            Error::InvalidInput(format!("{}: {} is not a valid {}", self.as_str(), value, what))
        };

        if let FieldValue::Text(s) = value {
            if s.trim().is_empty() {
                return Ok(FieldValue::Null);
            }
        }

        match self {
            ParcelField::OwnerName | ParcelField::OccupancyClass => match value {
                FieldValue::Null => Ok(FieldValue::Null),
                FieldValue::Text(s) => Ok(FieldValue::Text(s.trim().to_string())),
                FieldValue::Number(n) => Ok(FieldValue::Text(format_number(*n))),
                FieldValue::Bool(_) => Err(invalid("text value")),
            },
            ParcelField::PropertyValue
            | ParcelField::LotSize
            | ParcelField::Latitude
            | ParcelField::Longitude => match value {
                FieldValue::Null => Ok(FieldValue::Null),
                FieldValue::Number(n) if n.is_finite() => Ok(FieldValue::Number(*n)),
                FieldValue::Text(s) => {
                    let cleaned: String = s
                        .trim()
                        .chars()
                        .filter(|c| !matches!(c, '$' | ',' | ' '))
                        .collect();
                    cleaned
                        .parse::<f64>()
                        .ok()
                        .filter(|n| n.is_finite())
                        .map(FieldValue::Number)
                        .ok_or_else(|| invalid("number"))
                }
                _ => Err(invalid("number")),
            },
            ParcelField::ZonedByRight => match value {
                FieldValue::Null => Ok(FieldValue::Null),
                FieldValue::Bool(b) => {
                    let zoned = if *b { ZonedByRight::Yes } else { ZonedByRight::No };
                    Ok(FieldValue::Text(zoned.as_str().to_string()))
                }
                FieldValue::Text(s) => ZonedByRight::parse(s)
                    .map(|z| FieldValue::Text(z.as_str().to_string()))
                    .ok_or_else(|| invalid("zoning status")),
                FieldValue::Number(_) => Err(invalid("zoning status")),
            },
            ParcelField::FireSprinklers => match value {
                FieldValue::Null => Ok(FieldValue::Null),
                FieldValue::Bool(b) => Ok(FieldValue::Bool(*b)),
                FieldValue::Number(n) if *n == 1.0 => Ok(FieldValue::Bool(true)),
                FieldValue::Number(n) if *n == 0.0 => Ok(FieldValue::Bool(false)),
                FieldValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "yes" | "y" | "true" | "1" => Ok(FieldValue::Bool(true)),
                    "no" | "n" | "false" | "0" => Ok(FieldValue::Bool(false)),
                    _ => Err(invalid("yes/no value")),
                },
                FieldValue::Number(_) => Err(invalid("yes/no value")),
            },
        }
    }
}

impl fmt::Display for ParcelField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParcelField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        ParcelField::ALL
            .into_iter()
            .find(|f| f.as_str() == key)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown parcel field: {}", s)))
    }
}

/// Loosely typed attribute value as it arrives from a source record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    fn same_as(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Number(a), FieldValue::Number(b)) => (a - b).abs() <= NUMERIC_TOLERANCE,
            _ => self == other,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) => f.write_str(&format_number(*n)),
            FieldValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Field-level change set, ordered by field for stable audit output
pub type FieldChanges = BTreeMap<ParcelField, FieldValue>;

/// Canonical parcel record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    pub id: i64,
    /// Assessor parcel number, the structured identifier
    pub parcel_number: Option<String>,
    pub address: String,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub county: Option<String>,
    pub owner_name: Option<String>,
    pub property_value: Option<f64>,
    pub lot_size: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub zoned_by_right: Option<ZonedByRight>,
    pub occupancy_class: Option<String>,
    pub fire_sprinklers: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl ParcelRecord {
    /// New record with only location data populated
    pub fn new(id: i64, address: impl Into<String>) -> Self {
        Self {
            id,
            parcel_number: None,
            address: address.into(),
            city: None,
            zip: None,
            county: None,
            owner_name: None,
            property_value: None,
            lot_size: None,
            latitude: None,
            longitude: None,
            zoned_by_right: None,
            occupancy_class: None,
            fire_sprinklers: None,
            updated_at: Utc::now(),
        }
    }

    /// Current value of an updatable field
    pub fn get(&self, field: ParcelField) -> FieldValue {
        fn text(v: &Option<String>) -> FieldValue {
            v.as_ref().map_or(FieldValue::Null, |s| FieldValue::Text(s.clone()))
        }
        fn number(v: Option<f64>) -> FieldValue {
            v.map_or(FieldValue::Null, FieldValue::Number)
        }

        match field {
            ParcelField::OwnerName => text(&self.owner_name),
            ParcelField::PropertyValue => number(self.property_value),
            ParcelField::LotSize => number(self.lot_size),
            ParcelField::Latitude => number(self.latitude),
            ParcelField::Longitude => number(self.longitude),
            ParcelField::ZonedByRight => self
                .zoned_by_right
                .map_or(FieldValue::Null, |z| FieldValue::Text(z.as_str().to_string())),
            ParcelField::OccupancyClass => text(&self.occupancy_class),
            ParcelField::FireSprinklers => self.fire_sprinklers.map_or(FieldValue::Null, FieldValue::Bool),
        }
    }

    /// Assign a field after canonicalizing the value
    pub fn set(&mut self, field: ParcelField, value: &FieldValue) -> Result<()> {
        let value = field.canonicalize(value)?;

        match field {
            ParcelField::OwnerName => self.owner_name = as_text(value),
            ParcelField::PropertyValue => self.property_value = as_number(value),
            ParcelField::LotSize => self.lot_size = as_number(value),
            ParcelField::Latitude => self.latitude = as_number(value),
            ParcelField::Longitude => self.longitude = as_number(value),
            ParcelField::ZonedByRight => {
                self.zoned_by_right = as_text(value).and_then(|s| ZonedByRight::parse(&s))
            }
            ParcelField::OccupancyClass => self.occupancy_class = as_text(value),
            ParcelField::FireSprinklers => {
                self.fire_sprinklers = match value {
                    FieldValue::Bool(b) => Some(b),
                    _ => None,
                }
            }
        }
        Ok(())
    }

    /// Fields whose incoming value differs from the current one
    ///
    /// Values are canonicalized first, so `"Yes"` against a stored `true`
    /// is not a change. Returned values are canonical.
    pub fn diff(&self, updates: &FieldChanges) -> Result<FieldChanges> {
        let mut changes = FieldChanges::new();
        for (field, raw) in updates {
            let value = field.canonicalize(raw)?;
            if !self.get(*field).same_as(&value) {
                changes.insert(*field, value);
            }
        }
        Ok(changes)
    }

    /// Apply a change set in place
    pub fn apply(&mut self, changes: &FieldChanges) -> Result<()> {
        for (field, value) in changes {
            self.set(*field, value)?;
        }
        Ok(())
    }

    /// Assign a field exactly as given
    ///
    /// No trimming or coercion happens, so a value read back through `get`
    /// is stored unchanged. The value must already have the field's type.
    pub fn set_raw(&mut self, field: ParcelField, value: &FieldValue) -> Result<()> {
        let mismatch =
            || Error::InvalidInput(format!("{}: {} does not match the stored type", field.as_str(), value));

        match field {
            ParcelField::OwnerName => self.owner_name = raw_text(value).ok_or_else(mismatch)?,
            ParcelField::PropertyValue => self.property_value = raw_number(value).ok_or_else(mismatch)?,
            ParcelField::LotSize => self.lot_size = raw_number(value).ok_or_else(mismatch)?,
            ParcelField::Latitude => self.latitude = raw_number(value).ok_or_else(mismatch)?,
            ParcelField::Longitude => self.longitude = raw_number(value).ok_or_else(mismatch)?,
            ParcelField::ZonedByRight => {
                self.zoned_by_right = match value {
                    FieldValue::Null => None,
                    FieldValue::Text(s) => Some(ZonedByRight::parse(s).ok_or_else(mismatch)?),
                    _ => return Err(mismatch()),
                }
            }
            ParcelField::OccupancyClass => self.occupancy_class = raw_text(value).ok_or_else(mismatch)?,
            ParcelField::FireSprinklers => {
                self.fire_sprinklers = match value {
                    FieldValue::Null => None,
                    FieldValue::Bool(b) => Some(*b),
                    _ => return Err(mismatch()),
                }
            }
        }
        Ok(())
    }

    /// Fields whose stored value is not exactly `values`
    ///
    /// Unlike `diff`, nothing is canonicalized: `"  Acme "` differs from
    /// `"Acme"` and `""` differs from null.
    pub fn raw_diff(&self, values: &FieldChanges) -> FieldChanges {
        values
            .iter()
            .filter(|(field, value)| self.get(**field) != **value)
            .map(|(field, value)| (*field, value.clone()))
            .collect()
    }

    /// Apply a change set verbatim
    pub fn apply_raw(&mut self, changes: &FieldChanges) -> Result<()> {
        for (field, value) in changes {
            self.set_raw(*field, value)?;
        }
        Ok(())
    }

    /// Current values of the given fields
    pub fn values_of<'a>(&self, fields: impl IntoIterator<Item = &'a ParcelField>) -> FieldChanges {
        fields.into_iter().map(|f| (*f, self.get(*f))).collect()
    }

    /// Full JSON snapshot of the record
    pub fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn as_text(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(s) => Some(s),
        _ => None,
    }
}

fn as_number(value: FieldValue) -> Option<f64> {
    match value {
        FieldValue::Number(n) => Some(n),
        _ => None,
    }
}

fn raw_text(value: &FieldValue) -> Option<Option<String>> {
    match value {
        FieldValue::Null => Some(None),
        FieldValue::Text(s) => Some(Some(s.clone())),
        _ => None,
    }
}

fn raw_number(value: &FieldValue) -> Option<Option<f64>> {
    match value {
        FieldValue::Null => Some(None),
        FieldValue::Number(n) => Some(Some(*n)),
        _ => None,
    }
}
