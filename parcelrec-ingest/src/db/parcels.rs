//! Parcel database operations

use chrono::Utc;
use parcelrec_common::{Error, FieldChanges, ParcelRecord, Result, ZonedByRight};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::{audit, parse_timestamp};
use crate::models::{AuditLogEntry, AuditOperation};
use crate::storage::{CandidateScope, ScopeLevel, ScopedParcel};

const PARCEL_COLUMNS: &str = "id, parcel_number, address, city, zip, county, owner_name, \
     property_value, lot_size, latitude, longitude, zoned_by_right, occupancy_class, \
     fire_sprinklers, updated_at";

pub(crate) fn parcel_from_row(row: &SqliteRow) -> Result<ParcelRecord> {
    let zoned: Option<String> = row.get("zoned_by_right");
    let zoned_by_right = zoned
        .map(|z| {
            ZonedByRight::parse(&z)
                .ok_or_else(|| Error::Internal(format!("Invalid zoned_by_right in database: {}", z)))
        })
        .transpose()?;
    let updated_at: String = row.get("updated_at");

    Ok(ParcelRecord {
        id: row.get("id"),
        parcel_number: row.get("parcel_number"),
        address: row.get("address"),
        city: row.get("city"),
        zip: row.get("zip"),
        county: row.get("county"),
        owner_name: row.get("owner_name"),
        property_value: row.get("property_value"),
        lot_size: row.get("lot_size"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        zoned_by_right,
        occupancy_class: row.get("occupancy_class"),
        fire_sprinklers: row.get("fire_sprinklers"),
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

/// Insert or replace a full parcel row (seeding and bulk loads)
pub async fn save_parcel(pool: &SqlitePool, parcel: &ParcelRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO parcels (
            id, parcel_number, address, city, zip, county, owner_name,
            property_value, lot_size, latitude, longitude, zoned_by_right,
            occupancy_class, fire_sprinklers, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            parcel_number = excluded.parcel_number,
            address = excluded.address,
            city = excluded.city,
            zip = excluded.zip,
            county = excluded.county,
            owner_name = excluded.owner_name,
            property_value = excluded.property_value,
            lot_size = excluded.lot_size,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            zoned_by_right = excluded.zoned_by_right,
            occupancy_class = excluded.occupancy_class,
            fire_sprinklers = excluded.fire_sprinklers,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(parcel.id)
    .bind(&parcel.parcel_number)
    .bind(&parcel.address)
    .bind(&parcel.city)
    .bind(&parcel.zip)
    .bind(&parcel.county)
    .bind(&parcel.owner_name)
    .bind(parcel.property_value)
    .bind(parcel.lot_size)
    .bind(parcel.latitude)
    .bind(parcel.longitude)
    .bind(parcel.zoned_by_right.map(|z| z.as_str()))
    .bind(&parcel.occupancy_class)
    .bind(parcel.fire_sprinklers)
    .bind(parcel.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_parcel(pool: &SqlitePool, id: i64) -> Result<ParcelRecord> {
    let row = sqlx::query(&format!("SELECT {} FROM parcels WHERE id = ?", PARCEL_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("parcel {}", id)))?;

    parcel_from_row(&row)
}

pub async fn find_by_identifier(pool: &SqlitePool, parcel_number: &str) -> Result<Option<ParcelRecord>> {
    // Lowest id wins if the assessor data carries duplicate identifiers
    let row = sqlx::query(&format!(
        "SELECT {} FROM parcels WHERE parcel_number = ? ORDER BY id LIMIT 1",
        PARCEL_COLUMNS
    ))
    .bind(parcel_number.trim())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(parcel_from_row).transpose()
}

/// Scoped candidate lookup
///
/// Uses the zip/city/county indexes; an empty scope returns nothing rather
/// than scanning the table.
pub async fn candidates_for_scope(
    pool: &SqlitePool,
    scope: &CandidateScope,
    limit: usize,
) -> Result<Vec<ScopedParcel>> {
    if scope.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let number_prefix = scope.street_number.as_ref().map(|n| format!("{} %", n));

    let rows = sqlx::query(&format!(
        r#"
        SELECT {},
            CASE
                WHEN zip = ? THEN 0
                WHEN city = ? COLLATE NOCASE THEN 1
                ELSE 2
            END AS scope_rank,
            CASE WHEN address LIKE ? THEN 0 ELSE 1 END AS number_rank
        FROM parcels
        WHERE zip = ? OR city = ? COLLATE NOCASE OR county = ? COLLATE NOCASE
        ORDER BY scope_rank, number_rank, id
        LIMIT ?
        "#,
        PARCEL_COLUMNS
    ))
    .bind(&scope.zip)
    .bind(&scope.city)
    .bind(&number_prefix)
    .bind(&scope.zip)
    .bind(&scope.city)
    .bind(&scope.county)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ScopedParcel {
                parcel: parcel_from_row(row)?,
                scope: ScopeLevel::from_rank(row.get("scope_rank")),
            })
        })
        .collect()
}

/// Apply changes, append the audit row and stamp the causing update, in one transaction
///
/// `changes` are stored verbatim. Update callers pass the canonical values
/// produced by `ParcelRecord::diff`; rollback passes snapshot values as read.
pub async fn write_parcel_and_audit(
    pool: &SqlitePool,
    id: i64,
    changes: &FieldChanges,
    entry: &AuditLogEntry,
) -> Result<i64> {
    if entry.record_id != id {
        return Err(Error::InvalidInput(format!(
            "audit entry targets parcel {} but write targets parcel {}",
            entry.record_id, id
        )));
    }

    let mut tx = pool.begin().await?;

    // First statement writes, so the transaction takes the write lock before
    // it reads and concurrent writers queue on busy_timeout
    let touched = sqlx::query("UPDATE parcels SET updated_at = ? WHERE id = ?")
        .bind(entry.timestamp.to_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if touched.rows_affected() == 0 {
        return Err(Error::NotFound(format!("parcel {}", id)));
    }

    if entry.operation == AuditOperation::Update {
        if let Some(update_id) = entry.update_id {
            let result = sqlx::query(
                r#"
                UPDATE foia_updates
                SET status = 'applied', applied_at = ?, error_message = NULL
                WHERE id = ? AND status != 'applied'
                "#,
            )
            .bind(Utc::now().to_rfc3339())
            .bind(update_id.to_string())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                // Dropping the transaction rolls back everything written so far
                return Err(Error::Internal(format!(
                    "update {} is missing or already applied",
                    update_id
                )));
            }
        }
    }

    let row = sqlx::query(&format!("SELECT {} FROM parcels WHERE id = ?", PARCEL_COLUMNS))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    let mut parcel = parcel_from_row(&row)?;
    parcel.apply_raw(changes)?;
    parcel.updated_at = entry.timestamp;

    update_parcel_fields(&mut tx, &parcel).await?;
    let audit_id = audit::insert_entry(&mut tx, entry).await?;

    tx.commit().await?;
    Ok(audit_id)
}

async fn update_parcel_fields(tx: &mut Transaction<'_, Sqlite>, parcel: &ParcelRecord) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE parcels SET
            owner_name = ?,
            property_value = ?,
            lot_size = ?,
            latitude = ?,
            longitude = ?,
            zoned_by_right = ?,
            occupancy_class = ?,
            fire_sprinklers = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&parcel.owner_name)
    .bind(parcel.property_value)
    .bind(parcel.lot_size)
    .bind(parcel.latitude)
    .bind(parcel.longitude)
    .bind(parcel.zoned_by_right.map(|z| z.as_str()))
    .bind(&parcel.occupancy_class)
    .bind(parcel.fire_sprinklers)
    .bind(parcel.updated_at.to_rfc3339())
    .bind(parcel.id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
