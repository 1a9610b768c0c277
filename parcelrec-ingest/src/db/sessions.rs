//! Import session database operations

use parcelrec_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{parse_timestamp, parse_uuid};
use crate::models::{ImportSession, SessionStatus};

const SESSION_COLUMNS: &str = "id, filename, total_records, processed_records, successful_updates, \
     failed_updates, status, created_at, completed_at, failure_reason, rollback_failures";

pub(crate) fn session_from_row(row: &SqliteRow) -> Result<ImportSession> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(ImportSession {
        id: parse_uuid(&id, "id")?,
        filename: row.get("filename"),
        total_records: row.get::<i64, _>("total_records") as u64,
        processed_records: row.get::<i64, _>("processed_records") as u64,
        successful_updates: row.get::<i64, _>("successful_updates") as u64,
        failed_updates: row.get::<i64, _>("failed_updates") as u64,
        status: status.parse()?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        completed_at: completed_at
            .map(|s| parse_timestamp(&s, "completed_at"))
            .transpose()?,
        failure_reason: row.get("failure_reason"),
        rollback_failures: row.get::<i64, _>("rollback_failures") as u64,
    })
}

pub async fn insert_session(pool: &SqlitePool, session: &ImportSession) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO import_sessions (
            id, filename, total_records, processed_records, successful_updates,
            failed_updates, status, created_at, completed_at, failure_reason, rollback_failures
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.id.to_string())
    .bind(&session.filename)
    .bind(session.total_records as i64)
    .bind(session.processed_records as i64)
    .bind(session.successful_updates as i64)
    .bind(session.failed_updates as i64)
    .bind(session.status.as_str())
    .bind(session.created_at.to_rfc3339())
    .bind(session.completed_at.map(|dt| dt.to_rfc3339()))
    .bind(&session.failure_reason)
    .bind(session.rollback_failures as i64)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_session(pool: &SqlitePool, session_id: Uuid) -> Result<ImportSession> {
    let row = sqlx::query(&format!("SELECT {} FROM import_sessions WHERE id = ?", SESSION_COLUMNS))
        .bind(session_id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("import session {}", session_id)))?;

    session_from_row(&row)
}

pub async fn set_total_records(pool: &SqlitePool, session_id: Uuid, total_records: u64) -> Result<()> {
    let result = sqlx::query("UPDATE import_sessions SET total_records = ? WHERE id = ? AND status = 'uploading'")
        .bind(total_records as i64)
        .bind(session_id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        let current = load_session(pool, session_id).await?;
        return Err(Error::InvalidTransition {
            from: current.status.to_string(),
            to: SessionStatus::Uploading.to_string(),
        });
    }
    Ok(())
}

/// Compare-and-set on status
///
/// Two operators racing (e.g. finalize and a second rollback) cannot both win.
/// Completing requires every record counted; failing requires none counted.
pub async fn save_transition(pool: &SqlitePool, session: &ImportSession, expected: SessionStatus) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE import_sessions
        SET status = ?, completed_at = ?, failure_reason = ?, rollback_failures = ?,
            total_records = CASE WHEN ? = 'failed' THEN 0 ELSE total_records END
        WHERE id = ? AND status = ?
          AND (? != 'completed' OR processed_records = total_records)
          AND (? != 'failed' OR processed_records = 0)
        "#,
    )
    .bind(session.status.as_str())
    .bind(session.completed_at.map(|dt| dt.to_rfc3339()))
    .bind(&session.failure_reason)
    .bind(session.rollback_failures as i64)
    .bind(session.status.as_str())
    .bind(session.id.to_string())
    .bind(expected.as_str())
    .bind(session.status.as_str())
    .bind(session.status.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let current = load_session(pool, session.id).await?;
        if current.status == expected {
            return Err(Error::InvalidInput(format!(
                "session {} cannot become {} with {}/{} records processed",
                session.id, session.status, current.processed_records, current.total_records
            )));
        }
        return Err(Error::InvalidTransition {
            from: current.status.to_string(),
            to: session.status.to_string(),
        });
    }

    Ok(())
}
