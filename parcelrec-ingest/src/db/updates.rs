//! FOIA update database operations

use parcelrec_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::{parse_timestamp, parse_uuid, sessions};
use crate::models::{FoiaUpdate, MatchType, ReviewItem, SessionSummary, UpdateStatus};

const UPDATE_COLUMNS: &str = "id, import_session_id, source_address, parcel_id, matched_address, \
     match_confidence, match_type, field_updates, status, error_message, applied_at, tallied, created_at";

fn update_from_row(row: &SqliteRow) -> Result<FoiaUpdate> {
    let id: String = row.get("id");
    let session_id: String = row.get("import_session_id");
    let match_type: String = row.get("match_type");
    let field_updates: String = row.get("field_updates");
    let status: String = row.get("status");
    let applied_at: Option<String> = row.get("applied_at");
    let created_at: String = row.get("created_at");

    Ok(FoiaUpdate {
        id: parse_uuid(&id, "id")?,
        import_session_id: parse_uuid(&session_id, "import_session_id")?,
        source_address: row.get("source_address"),
        parcel_id: row.get("parcel_id"),
        matched_address: row.get("matched_address"),
        match_confidence: row.get("match_confidence"),
        match_type: match_type.parse()?,
        field_updates: serde_json::from_str(&field_updates)?,
        status: status.parse()?,
        error_message: row.get("error_message"),
        applied_at: applied_at
            .map(|s| parse_timestamp(&s, "applied_at"))
            .transpose()?,
        tallied: row.get::<i64, _>("tallied") != 0,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

pub async fn find_update(pool: &SqlitePool, session_id: Uuid, source_address: &str) -> Result<Option<FoiaUpdate>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM foia_updates WHERE import_session_id = ? AND source_address = ?",
        UPDATE_COLUMNS
    ))
    .bind(session_id.to_string())
    .bind(source_address)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(update_from_row).transpose()
}

pub async fn upsert_pending_update(pool: &SqlitePool, update: &FoiaUpdate) -> Result<FoiaUpdate> {
    let field_updates = serde_json::to_string(&update.field_updates)?;

    sqlx::query(
        r#"
        INSERT INTO foia_updates (
            id, import_session_id, source_address, parcel_id, matched_address,
            match_confidence, match_type, field_updates, status, tallied, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
        ON CONFLICT(import_session_id, source_address) DO UPDATE SET
            parcel_id = excluded.parcel_id,
            matched_address = excluded.matched_address,
            match_confidence = excluded.match_confidence,
            match_type = excluded.match_type,
            field_updates = excluded.field_updates,
            status = 'pending',
            error_message = NULL
        WHERE foia_updates.tallied = 0 AND foia_updates.status != 'applied'
        "#,
    )
    .bind(update.id.to_string())
    .bind(update.import_session_id.to_string())
    .bind(&update.source_address)
    .bind(update.parcel_id)
    .bind(&update.matched_address)
    .bind(update.match_confidence)
    .bind(update.match_type.as_str())
    .bind(field_updates)
    .bind(update.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    find_update(pool, update.import_session_id, &update.source_address)
        .await?
        .ok_or_else(|| Error::Internal(format!("update for {:?} vanished after upsert", update.source_address)))
}

async fn insert_final_update(tx: &mut Transaction<'_, Sqlite>, update: &FoiaUpdate) -> Result<()> {
    let field_updates = serde_json::to_string(&update.field_updates)?;

    sqlx::query(
        r#"
        INSERT INTO foia_updates (
            id, import_session_id, source_address, parcel_id, matched_address,
            match_confidence, match_type, field_updates, status, error_message,
            applied_at, tallied, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 1, ?)
        "#,
    )
    .bind(update.id.to_string())
    .bind(update.import_session_id.to_string())
    .bind(&update.source_address)
    .bind(update.parcel_id)
    .bind(&update.matched_address)
    .bind(update.match_confidence)
    .bind(update.match_type.as_str())
    .bind(field_updates)
    .bind(update.status.as_str())
    .bind(&update.error_message)
    .bind(update.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Count one outcome exactly once
///
/// The stored row decides idempotence: an already tallied (session,
/// source_address) pair is not counted again, and a stored `applied` status
/// (stamped atomically with the parcel write) wins over the caller's view.
pub async fn tally_outcome(pool: &SqlitePool, update: &FoiaUpdate) -> Result<Option<UpdateStatus>> {
    let session_id = update.import_session_id.to_string();
    let mut tx = pool.begin().await?;

    // Take the write lock before reading so concurrent tallies queue on
    // busy_timeout instead of failing on a stale snapshot
    sqlx::query("UPDATE import_sessions SET processed_records = processed_records WHERE id = ?")
        .bind(&session_id)
        .execute(&mut *tx)
        .await?;

    let existing = sqlx::query(
        "SELECT id, status, tallied FROM foia_updates WHERE import_session_id = ? AND source_address = ?",
    )
    .bind(&session_id)
    .bind(&update.source_address)
    .fetch_optional(&mut *tx)
    .await?;

    let final_status = match existing {
        Some(row) => {
            if row.get::<i64, _>("tallied") != 0 {
                return Ok(None);
            }

            let stored: String = row.get("status");
            let stored: UpdateStatus = stored.parse()?;
            let status = if stored == UpdateStatus::Applied {
                UpdateStatus::Applied
            } else {
                update.status
            };
            if status == UpdateStatus::Pending {
                return Err(Error::InvalidInput(format!(
                    "outcome for {:?} is still pending",
                    update.source_address
                )));
            }
            if status == UpdateStatus::Applied && stored != UpdateStatus::Applied {
                return Err(Error::Internal(format!(
                    "update for {:?} reported applied but storage has {}",
                    update.source_address, stored
                )));
            }

            let error_message = if status == UpdateStatus::Applied {
                None
            } else {
                update.error_message.clone()
            };
            let row_id: String = row.get("id");

            sqlx::query("UPDATE foia_updates SET status = ?, error_message = ?, tallied = 1 WHERE id = ?")
                .bind(status.as_str())
                .bind(error_message)
                .bind(row_id)
                .execute(&mut *tx)
                .await?;

            status
        }
        None => {
            if !matches!(update.status, UpdateStatus::Failed | UpdateStatus::Skipped) {
                return Err(Error::InvalidInput(format!(
                    "cannot record a {} outcome for {:?} without a stored update",
                    update.status, update.source_address
                )));
            }
            insert_final_update(&mut tx, update).await?;
            update.status
        }
    };

    let (successful, failed) = if final_status == UpdateStatus::Applied { (1i64, 0i64) } else { (0, 1) };
    let result = sqlx::query(
        r#"
        UPDATE import_sessions
        SET processed_records = processed_records + 1,
            successful_updates = successful_updates + ?,
            failed_updates = failed_updates + ?
        WHERE id = ? AND status = 'processing' AND processed_records < total_records
        "#,
    )
    .bind(successful)
    .bind(failed)
    .bind(&session_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::InvalidInput(format!(
            "session {} is not accepting outcomes",
            update.import_session_id
        )));
    }

    tx.commit().await?;
    Ok(Some(final_status))
}

pub async fn tallied_sources(pool: &SqlitePool, session_id: Uuid) -> Result<HashSet<String>> {
    let keys: Vec<String> = sqlx::query_scalar(
        "SELECT source_address FROM foia_updates WHERE import_session_id = ? AND tallied = 1",
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(keys.into_iter().collect())
}

pub async fn updates_for_session(pool: &SqlitePool, session_id: Uuid) -> Result<Vec<FoiaUpdate>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM foia_updates WHERE import_session_id = ? ORDER BY created_at, source_address",
        UPDATE_COLUMNS
    ))
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(update_from_row).collect()
}

pub async fn session_summary(pool: &SqlitePool, session_id: Uuid) -> Result<SessionSummary> {
    let session = sessions::load_session(pool, session_id).await?;

    let mut by_status = BTreeMap::new();
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM foia_updates WHERE import_session_id = ? GROUP BY status",
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;
    for row in &rows {
        let status: String = row.get("status");
        by_status.insert(status.parse::<UpdateStatus>()?, row.get::<i64, _>("n") as u64);
    }

    let mut by_match_type = BTreeMap::new();
    let rows = sqlx::query(
        "SELECT match_type, COUNT(*) AS n FROM foia_updates WHERE import_session_id = ? GROUP BY match_type",
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;
    for row in &rows {
        let match_type: String = row.get("match_type");
        by_match_type.insert(match_type.parse::<MatchType>()?, row.get::<i64, _>("n") as u64);
    }

    let mut needs_review = Vec::new();
    let mut failures = Vec::new();
    for update in updates_for_session(pool, session_id).await? {
        let item = ReviewItem {
            source_address: update.source_address.clone(),
            match_type: update.match_type,
            match_confidence: update.match_confidence,
            matched_address: update.matched_address.clone(),
            status: update.status,
            error_message: update.error_message.clone(),
        };
        if update.status == UpdateStatus::Failed {
            failures.push(item);
        } else if update.match_type == MatchType::LowConfidence {
            needs_review.push(item);
        }
    }

    tracing::debug!(
        session_id = %session_id,
        review = needs_review.len(),
        failures = failures.len(),
        "Built session summary"
    );

    Ok(SessionSummary {
        session,
        by_status,
        by_match_type,
        needs_review,
        failures,
    })
}
