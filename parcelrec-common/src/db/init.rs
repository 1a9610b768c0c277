//! Database initialization
//!
//! Creates the database file on first run, applies connection pragmas, creates
//! every table idempotently and then runs versioned migrations.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// SQLite busy timeout
///
/// Kept short so lock contention surfaces as "database is locked" and is
/// handled by the retry policy rather than blocking a worker.
const BUSY_TIMEOUT_MS: u64 = 250;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Pragmas are per connection, so they go on the connect options rather
    // than a one-off query against whichever connection the pool hands out
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema_version_table(&pool).await?;
    create_parcels_table(&pool).await?;
    create_import_sessions_table(&pool).await?;
    create_foia_updates_table(&pool).await?;
    create_audit_log_table(&pool).await?;

    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_parcels_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parcels (
            id INTEGER PRIMARY KEY,
            parcel_number TEXT,
            address TEXT NOT NULL,
            city TEXT,
            zip TEXT,
            county TEXT,
            owner_name TEXT,
            property_value REAL,
            lot_size REAL,
            latitude REAL,
            longitude REAL,
            zoned_by_right TEXT CHECK (zoned_by_right IN ('yes', 'no', 'special_exemption')),
            occupancy_class TEXT,
            fire_sprinklers INTEGER CHECK (fire_sprinklers IN (0, 1)),
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Scoped candidate lookups must never scan the full table
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_parcels_zip ON parcels(zip)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_parcels_city ON parcels(city COLLATE NOCASE)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_parcels_county ON parcels(county COLLATE NOCASE)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_parcels_parcel_number ON parcels(parcel_number)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_import_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_sessions (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            total_records INTEGER NOT NULL DEFAULT 0,
            processed_records INTEGER NOT NULL DEFAULT 0,
            successful_updates INTEGER NOT NULL DEFAULT 0,
            failed_updates INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL CHECK (status IN ('uploading', 'processing', 'completed', 'failed', 'rolled_back')),
            created_at TEXT NOT NULL,
            completed_at TEXT,
            failure_reason TEXT,
            CHECK (processed_records <= total_records),
            CHECK (successful_updates + failed_updates <= total_records)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_foia_updates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS foia_updates (
            id TEXT PRIMARY KEY,
            import_session_id TEXT NOT NULL REFERENCES import_sessions(id) ON DELETE CASCADE,
            source_address TEXT NOT NULL,
            parcel_id INTEGER REFERENCES parcels(id),
            matched_address TEXT,
            match_confidence REAL NOT NULL CHECK (match_confidence >= 0.0 AND match_confidence <= 1.0),
            match_type TEXT NOT NULL CHECK (match_type IN ('exact_match', 'high_confidence', 'medium_confidence', 'low_confidence', 'no_match')),
            field_updates TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL CHECK (status IN ('pending', 'applied', 'failed', 'skipped')),
            error_message TEXT,
            applied_at TEXT,
            tallied INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (import_session_id, source_address)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_foia_updates_status ON foia_updates(import_session_id, status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_audit_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('update', 'rollback')),
            old_values TEXT NOT NULL,
            new_values TEXT NOT NULL,
            changed_fields TEXT NOT NULL,
            session_id TEXT NOT NULL,
            update_id TEXT,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_session ON audit_log(session_id, operation)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_record ON audit_log(table_name, record_id)")
        .execute(pool)
        .await?;

    Ok(())
}
