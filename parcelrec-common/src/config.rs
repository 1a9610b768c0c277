//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from an optional TOML file. Every section is
//! optional and falls back to built-in defaults.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (`--root-folder`, `--database`, `--concurrency`)
//! 2. Environment variables (`PARCELREC_ROOT_FOLDER`, `PARCELREC_DATABASE`,
//!    `PARCELREC_LOG_LEVEL`, `PARCELREC_CONCURRENCY`)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants, OS-dependent root folder)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "PARCELREC_ROOT_FOLDER";
/// Environment variable naming the SQLite database file
pub const DATABASE_ENV: &str = "PARCELREC_DATABASE";
/// Environment variable overriding `logging.level`
pub const LOG_LEVEL_ENV: &str = "PARCELREC_LOG_LEVEL";
/// Environment variable overriding `workers.concurrency`
pub const CONCURRENCY_ENV: &str = "PARCELREC_CONCURRENCY";

/// Database file name used when no explicit path is configured
pub const DEFAULT_DATABASE_FILE: &str = "parcelrec.db";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    /// Path to SQLite database file (optional)
    ///
    /// If not specified, `<root_folder>/parcelrec.db` is used
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Root folder for the database and working files (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Match tier thresholds and tie handling
    #[serde(default)]
    pub matching: MatchSettings,

    /// Retry policy for transient write failures
    #[serde(default)]
    pub retry: RetrySettings,

    /// Worker pool sizing and per-record bounds
    #[serde(default)]
    pub workers: WorkerSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// How an apparent tie at the top of the candidate ranking is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TiePolicy {
    /// Break the tie deterministically (narrower scope, then lowest parcel id)
    #[default]
    Resolve,
    /// Keep the deterministic winner but classify it low confidence
    Downgrade,
}

/// Match tier thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct MatchSettings {
    /// Confidence assigned to identifier matches
    #[serde(default = "default_exact")]
    pub exact: f64,

    /// Confidence assigned to normalized-address equality
    #[serde(default = "default_high")]
    pub high: f64,

    /// Minimum similarity for medium confidence (auto-applied)
    #[serde(default = "default_medium_floor")]
    pub medium_floor: f64,

    /// Minimum similarity for low confidence (manual review only)
    #[serde(default = "default_low_floor")]
    pub low_floor: f64,

    /// Scores closer than this are considered tied
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f64,

    #[serde(default)]
    pub tie_policy: TiePolicy,

    /// Upper bound on candidates fetched per scoped lookup
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            exact: default_exact(),
            high: default_high(),
            medium_floor: default_medium_floor(),
            low_floor: default_low_floor(),
            tie_epsilon: default_tie_epsilon(),
            tie_policy: TiePolicy::default(),
            max_candidates: default_max_candidates(),
        }
    }
}

/// Retry policy settings
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Records processed in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on one record's apply step, retries included
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Upper bound on waiting for one parcel's lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            apply_timeout_ms: default_apply_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl WorkerSettings {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exact() -> f64 {
    1.0
}

fn default_high() -> f64 {
    0.95
}

fn default_medium_floor() -> f64 {
    0.55
}

fn default_low_floor() -> f64 {
    0.30
}

fn default_tie_epsilon() -> f64 {
    1e-6
}

fn default_max_candidates() -> usize {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_concurrency() -> usize {
    4
}

fn default_apply_timeout_ms() -> u64 {
    10_000
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

impl TomlConfig {
    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PARCELREC_*` environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var(DATABASE_ENV) {
            self.database_path = Some(PathBuf::from(path));
        }

        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            self.logging.level = level;
        }

        if let Ok(value) = std::env::var(CONCURRENCY_ENV) {
            self.workers.concurrency = value.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a positive integer, got {:?}", CONCURRENCY_ENV, value))
            })?;
        }

        self.validate()
    }

    /// Reject settings the matching and worker code cannot honor
    pub fn validate(&self) -> Result<()> {
        let m = &self.matching;
        for (name, value) in [
            ("exact", m.exact),
            ("high", m.high),
            ("medium_floor", m.medium_floor),
            ("low_floor", m.low_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "matching.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if m.low_floor > m.medium_floor {
            return Err(Error::Config(format!(
                "matching.low_floor ({}) must not exceed matching.medium_floor ({})",
                m.low_floor, m.medium_floor
            )));
        }
        if m.medium_floor > m.high {
            return Err(Error::Config(format!(
                "matching.medium_floor ({}) must not exceed matching.high ({})",
                m.medium_floor, m.high
            )));
        }
        if m.high > m.exact {
            return Err(Error::Config(format!(
                "matching.high ({}) must not exceed matching.exact ({})",
                m.high, m.exact
            )));
        }
        if !(0.0..1.0).contains(&m.tie_epsilon) {
            return Err(Error::Config(format!(
                "matching.tie_epsilon must be within [0, 1), got {}",
                m.tie_epsilon
            )));
        }
        if m.max_candidates == 0 {
            return Err(Error::Config("matching.max_candidates must be at least 1".to_string()));
        }

        let r = &self.retry;
        if r.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                r.backoff_multiplier
            )));
        }
        if r.initial_backoff_ms > r.max_backoff_ms {
            return Err(Error::Config(format!(
                "retry.initial_backoff_ms ({}) must not exceed retry.max_backoff_ms ({})",
                r.initial_backoff_ms, r.max_backoff_ms
            )));
        }

        let w = &self.workers;
        if w.concurrency == 0 {
            return Err(Error::Config("workers.concurrency must be at least 1".to_string()));
        }
        if w.apply_timeout_ms == 0 || w.lock_timeout_ms == 0 {
            return Err(Error::Config("workers timeouts must be greater than zero".to_string()));
        }

        Ok(())
    }
}

/// Load configuration from a TOML file
///
/// A missing file is not an error: defaults are used and a warning is logged.
/// A file that exists but cannot be parsed or validated is a `Config` error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!("Config file not found at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = TomlConfig::from_toml_str(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Default configuration file path for the platform
///
/// `~/.config/parcelrec/config.toml` on Linux, the platform config dir elsewhere.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("parcelrec").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("/etc/parcelrec/config.toml"))
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, config: Option<&TomlConfig>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        return PathBuf::from(path);
    }

    // Priority 3: TOML config file
    if let Some(root) = config.and_then(|c| c.root_folder.clone()) {
        return root;
    }

    // Priority 4: OS-dependent compiled default
    get_default_root_folder()
}

/// Database path: explicit CLI path, else configured path (env already
/// applied), else `<root>/parcelrec.db`
pub fn resolve_database_path(cli_arg: Option<&str>, config: &TomlConfig, root_folder: &Path) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    config
        .database_path
        .clone()
        .unwrap_or_else(|| root_folder.join(DEFAULT_DATABASE_FILE))
}

/// Get OS-dependent default root folder path
fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/parcelrec (or /var/lib/parcelrec for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("parcelrec"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/parcelrec"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("parcelrec"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/parcelrec"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("parcelrec"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\parcelrec"))
    } else {
        PathBuf::from("./parcelrec_data")
    }
}
