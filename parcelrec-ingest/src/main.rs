//! parcelrec-ingest - FOIA parcel reconciliation CLI
//!
//! Imports a file of FOIA source records into the parcel database, resumes an
//! interrupted import, rolls back a completed one, or prints a session summary.
//!
//! Input files are either a JSON array of objects or JSON lines (one object
//! per line).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parcelrec_common::config::{self, TomlConfig};
use parcelrec_common::db::init_database;
use parcelrec_common::events::EventBus;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use parcelrec_ingest::models::SourceRecord;
use parcelrec_ingest::IngestContext;

#[derive(Parser, Debug)]
#[command(name = "parcelrec-ingest")]
#[command(about = "Reconcile FOIA source records against canonical parcel records")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root folder for the database and working files
    #[arg(short, long, global = true, env = "PARCELREC_ROOT_FOLDER")]
    root_folder: Option<String>,

    /// SQLite database file (defaults to <root>/parcelrec.db)
    #[arg(short, long, global = true, env = "PARCELREC_DATABASE")]
    database: Option<String>,

    /// Records processed in parallel
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new import session from a file
    Import { file: PathBuf },
    /// Continue a processing session from the same file
    Resume { session: Uuid, file: PathBuf },
    /// Restore pre-import values for a completed session
    Rollback { session: Uuid },
    /// Print session counters and the records needing review
    Status { session: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut toml_config = config::load_toml_config(&config_path).context("Failed to load configuration")?;
    toml_config.apply_env_overrides()?;
    if let Some(concurrency) = args.concurrency {
        toml_config.workers.concurrency = concurrency;
    }
    toml_config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| toml_config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting parcelrec-ingest {}", env!("CARGO_PKG_VERSION"));

    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), Some(&toml_config));
    let db_path = config::resolve_database_path(args.database.as_deref(), &toml_config, &root_folder);
    info!("Database: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .context("Failed to open database")?;
    let ctx = IngestContext::from_pool(pool, &toml_config, EventBus::new(1000));

    match args.command {
        Command::Import { file } => {
            let session = ctx.pipeline.open(&file_label(&file)).await?;
            let contents = match tokio::fs::read_to_string(&file).await {
                Ok(contents) => contents,
                Err(e) => {
                    let reason = format!("Failed to read {}: {}", file.display(), e);
                    ctx.sessions.fail(session.id, &reason).await?;
                    bail!(reason);
                }
            };
            let outcome = ctx
                .pipeline
                .ingest(session.id, &contents, cancel_on_ctrl_c())
                .await?;
            print_json(&outcome)?;
            if let Some(reason) = &outcome.session.failure_reason {
                bail!("Import session {} failed: {}", outcome.session.id, reason);
            }
        }
        Command::Resume { session, file } => {
            let records = read_records(&file).await?;
            let outcome = ctx
                .pipeline
                .resume(session, records, cancel_on_ctrl_c())
                .await?;
            print_json(&outcome)?;
        }
        Command::Rollback { session } => {
            let report = ctx.rollback.rollback(session).await?;
            print_json(&report)?;
            if !report.failures.is_empty() {
                bail!("{} audit entries could not be restored", report.failures.len());
            }
        }
        Command::Status { session } => {
            let summary = ctx.sessions.summary(session).await?;
            print_json(&summary)?;
        }
    }

    Ok(())
}

/// Token cancelled on the first Ctrl+C; in-flight records still finish
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping after in-flight records");
                child.cancel();
            }
            Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
        }
    });
    token
}

async fn read_records(path: &Path) -> Result<Vec<SourceRecord>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let records =
        SourceRecord::parse_input(&content).with_context(|| format!("Failed to parse {}", path.display()))?;

    info!("Read {} source records from {}", records.len(), path.display());
    Ok(records)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
