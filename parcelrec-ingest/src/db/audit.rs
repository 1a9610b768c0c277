//! Audit log database operations
//!
//! Insert-only; the schema rejects UPDATE and DELETE on audit_log.

use parcelrec_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::{parse_timestamp, parse_uuid};
use crate::models::AuditLogEntry;

pub(crate) async fn insert_entry(tx: &mut Transaction<'_, Sqlite>, entry: &AuditLogEntry) -> Result<i64> {
    let old_values = serde_json::to_string(&entry.old_values)?;
    let new_values = serde_json::to_string(&entry.new_values)?;
    let changed_fields = serde_json::to_string(&entry.changed_fields)?;

    let result = sqlx::query(
        r#"
        INSERT INTO audit_log (
            table_name, record_id, operation, old_values, new_values,
            changed_fields, session_id, update_id, timestamp
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.table_name)
    .bind(entry.record_id)
    .bind(entry.operation.as_str())
    .bind(old_values)
    .bind(new_values)
    .bind(changed_fields)
    .bind(entry.session_id.to_string())
    .bind(entry.update_id.map(|id| id.to_string()))
    .bind(entry.timestamp.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

fn entry_from_row(row: &SqliteRow) -> Result<AuditLogEntry> {
    let operation: String = row.get("operation");
    let old_values: String = row.get("old_values");
    let new_values: String = row.get("new_values");
    let changed_fields: String = row.get("changed_fields");
    let session_id: String = row.get("session_id");
    let update_id: Option<String> = row.get("update_id");
    let timestamp: String = row.get("timestamp");

    Ok(AuditLogEntry {
        id: Some(row.get("id")),
        table_name: row.get("table_name"),
        record_id: row.get("record_id"),
        operation: operation.parse()?,
        old_values: serde_json::from_str(&old_values)?,
        new_values: serde_json::from_str(&new_values)?,
        changed_fields: serde_json::from_str(&changed_fields)?,
        session_id: parse_uuid(&session_id, "session_id")?,
        update_id: update_id.map(|id| parse_uuid(&id, "update_id")).transpose()?,
        timestamp: parse_timestamp(&timestamp, "timestamp")?,
    })
}

/// Entries for a session in insertion order
pub async fn entries_for_session(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<AuditLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, table_name, record_id, operation, old_values, new_values,
               changed_fields, session_id, update_id, timestamp
        FROM audit_log
        WHERE session_id = ?
        ORDER BY id
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Entries touching one parcel, oldest first
pub async fn entries_for_parcel(pool: &SqlitePool, parcel_id: i64) -> Result<Vec<AuditLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, table_name, record_id, operation, old_values, new_values,
               changed_fields, session_id, update_id, timestamp
        FROM audit_log
        WHERE table_name = 'parcels' AND record_id = ?
        ORDER BY id
        "#,
    )
    .bind(parcel_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(entry_from_row).collect()
}
