//! Raw source records as read from an input extract

use parcelrec_common::{Error, FieldChanges, FieldValue, ParcelField, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Keys accepted as the structured parcel identifier
const IDENTIFIER_KEYS: [&str; 4] = ["parcel_number", "apn", "identifier", "parcel_id"];

/// One externally sourced record: location data plus requested field values
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct SourceRecord {
    pub address: Option<String>,
    pub parcel_number: Option<String>,
    pub zip: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub fields: FieldChanges,
}

impl SourceRecord {
    /// Build from a JSON object
    ///
    /// Keys that are neither location data nor updatable parcel fields are
    /// ignored; values that cannot be represented are an `InvalidInput` error.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidInput("source record must be a JSON object".to_string()));
        };
        Self::from_map(map)
    }

    fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut record = SourceRecord::default();

        for (key, value) in map {
            let normalized_key = key.trim().to_ascii_lowercase();
            match normalized_key.as_str() {
                "address" | "source_address" => record.address = scalar_text(&key, value)?,
                "zip" | "zip_code" | "zipcode" => record.zip = scalar_text(&key, value)?,
                "city" => record.city = scalar_text(&key, value)?,
                "county" => record.county = scalar_text(&key, value)?,
                k if IDENTIFIER_KEYS.contains(&k) => record.parcel_number = scalar_text(&key, value)?,
                _ => match normalized_key.parse::<ParcelField>() {
                    Ok(field) => {
                        record.fields.insert(field, field_value(&key, value)?);
                    }
                    Err(_) => debug!(key = %key, "Ignoring unknown source column"),
                },
            }
        }

        Ok(record)
    }

    /// Parse an input extract: a JSON array of objects, or one JSON object
    /// per non-blank line
    ///
    /// Any malformed line or record rejects the whole input.
    pub fn parse_input(content: &str) -> Result<Vec<SourceRecord>> {
        let values: Vec<Value> = if content.trim_start().starts_with('[') {
            serde_json::from_str(content)?
        } else {
            content
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(i, line)| {
                    serde_json::from_str::<Value>(line).map_err(|e| {
                        Error::InvalidInput(format!("line {} is not valid JSON: {}", i + 1, e))
                    })
                })
                .collect::<Result<_>>()?
        };

        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                Self::from_json(value)
                    .map_err(|e| Error::InvalidInput(format!("record {} is malformed: {}", i + 1, e)))
            })
            .collect()
    }

    /// Stable key identifying this record within one input
    ///
    /// Trimmed raw address, else `parcel:<identifier>`, else `row:<index>`.
    pub fn source_key(&self, index: usize) -> String {
        if let Some(address) = self.address.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            return address.to_string();
        }
        if let Some(id) = self.identifier() {
            return format!("parcel:{}", id);
        }
        format!("row:{}", index)
    }

    /// Trimmed, non-empty structured identifier
    pub fn identifier(&self) -> Option<&str> {
        self.parcel_number
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

fn scalar_text(key: &str, value: Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(Error::InvalidInput(format!("{} must be text, got {}", key, other))),
    }
}

fn field_value(key: &str, value: Value) -> Result<FieldValue> {
    match value {
        Value::Null => Ok(FieldValue::Null),
        Value::Bool(b) => Ok(FieldValue::Bool(b)),
        Value::Number(n) => n
            .as_f64()
            .map(FieldValue::Number)
            .ok_or_else(|| Error::InvalidInput(format!("{} is out of range", key))),
        Value::String(s) => Ok(FieldValue::Text(s)),
        other => Err(Error::InvalidInput(format!(
            "{} must be a scalar value, got {}",
            key, other
        ))),
    }
}
