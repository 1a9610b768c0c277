//! Audit log entries
//!
//! One entry is written in the same transaction as every parcel mutation.
//! Entries are never modified; rollback reads them and appends its own.

use chrono::{DateTime, Utc};
use parcelrec_common::{Error, FieldChanges, ParcelField, ParcelRecord, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const PARCELS_TABLE: &str = "parcels";

/// Kind of mutation an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// Import applied a FOIA update
    Update,
    /// Rollback restored pre-session values
    Rollback,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Update => "update",
            AuditOperation::Rollback => "rollback",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "update" => Ok(AuditOperation::Update),
            "rollback" => Ok(AuditOperation::Rollback),
            other => Err(Error::Internal(format!("Unknown audit operation: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Assigned by storage on insert
    pub id: Option<i64>,
    pub table_name: String,
    pub record_id: i64,
    pub operation: AuditOperation,
    /// Full pre-change snapshot of the parcel
    pub old_values: serde_json::Value,
    /// Changed fields with their new values
    pub new_values: FieldChanges,
    pub changed_fields: Vec<ParcelField>,
    pub session_id: Uuid,
    /// FOIA update that caused the change (update entries only)
    pub update_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    fn new(
        operation: AuditOperation,
        session_id: Uuid,
        update_id: Option<Uuid>,
        before: &ParcelRecord,
        changes: &FieldChanges,
    ) -> Result<Self> {
        Ok(Self {
            id: None,
            table_name: PARCELS_TABLE.to_string(),
            record_id: before.id,
            operation,
            old_values: before.snapshot()?,
            new_values: changes.clone(),
            changed_fields: changes.keys().copied().collect(),
            session_id,
            update_id,
            timestamp: Utc::now(),
        })
    }

    /// Entry for an applied FOIA update
    pub fn for_update(
        session_id: Uuid,
        update_id: Uuid,
        before: &ParcelRecord,
        changes: &FieldChanges,
    ) -> Result<Self> {
        Self::new(AuditOperation::Update, session_id, Some(update_id), before, changes)
    }

    /// Entry for a rollback restore
    pub fn for_rollback(session_id: Uuid, before: &ParcelRecord, changes: &FieldChanges) -> Result<Self> {
        Self::new(AuditOperation::Rollback, session_id, None, before, changes)
    }

    /// Pre-change values of the fields this entry changed
    pub fn restore_values(&self) -> Result<FieldChanges> {
        let before: ParcelRecord = serde_json::from_value(self.old_values.clone())?;
        Ok(before.values_of(&self.changed_fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcelrec_common::FieldValue;

    #[test]
    fn test_update_entry_records_snapshot_and_diff() {
        let mut before = ParcelRecord::new(5, "123 MAIN STREET");
        before.fire_sprinklers = Some(false);
        before.owner_name = Some("ACME".to_string());

        let mut changes = FieldChanges::new();
        changes.insert(ParcelField::FireSprinklers, FieldValue::Bool(true));

        let entry = AuditLogEntry::for_update(Uuid::new_v4(), Uuid::new_v4(), &before, &changes).unwrap();
        assert_eq!(entry.record_id, 5);
        assert_eq!(entry.table_name, "parcels");
        assert_eq!(entry.changed_fields, vec![ParcelField::FireSprinklers]);
        assert_eq!(entry.old_values["owner_name"], "ACME");

        let restore = entry.restore_values().unwrap();
        assert_eq!(restore.len(), 1);
        assert_eq!(restore.get(&ParcelField::FireSprinklers), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn test_operation_text() {
        assert_eq!("rollback".parse::<AuditOperation>().unwrap(), AuditOperation::Rollback);
        assert!("delete".parse::<AuditOperation>().is_err());
    }
}
