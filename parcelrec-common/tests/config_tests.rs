//! Configuration loading and root folder resolution
//!
//! Tests that manipulate PARCELREC_* environment variables are marked with
//! #[serial] so they never run in parallel with each other.

use parcelrec_common::config::{
    load_toml_config, resolve_root_folder, TiePolicy, TomlConfig, CONCURRENCY_ENV,
    DATABASE_ENV, LOG_LEVEL_ENV, ROOT_FOLDER_ENV,
};
use parcelrec_common::Error;
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_missing_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(&temp_dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.logging.level, "info");
    assert_eq!(config.matching.medium_floor, 0.55);
    assert!(config.database_path.is_none());
}

#[test]
fn test_full_file_is_parsed() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        database_path = "/srv/parcelrec/parcels.db"
        root_folder = "/srv/parcelrec"

        [logging]
        level = "debug"

        [matching]
        medium_floor = 0.6
        low_floor = 0.35
        tie_policy = "downgrade"
        max_candidates = 200

        [retry]
        max_retries = 5
        initial_backoff_ms = 20

        [workers]
        concurrency = 8
        apply_timeout_ms = 5000
        "#,
    )
    .unwrap();

    let config = load_toml_config(&path).unwrap();
    assert_eq!(config.database_path, Some(PathBuf::from("/srv/parcelrec/parcels.db")));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.matching.tie_policy, TiePolicy::Downgrade);
    assert_eq!(config.matching.max_candidates, 200);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.max_backoff_ms, 1000);
    assert_eq!(config.workers.concurrency, 8);
    assert_eq!(config.workers.lock_timeout_ms, 2000);
}

#[test]
fn test_invalid_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "[retry]\nbackoff_multiplier = 0.5\n").unwrap();

    let result = load_toml_config(&path);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_env_overrides_file_values() {
    env::set_var(DATABASE_ENV, "/tmp/parcelrec-env.db");
    env::set_var(LOG_LEVEL_ENV, "trace");
    env::set_var(CONCURRENCY_ENV, "2");

    let mut config = TomlConfig::from_toml_str("[workers]\nconcurrency = 16\n").unwrap();
    config.apply_env_overrides().unwrap();

    assert_eq!(config.database_path, Some(PathBuf::from("/tmp/parcelrec-env.db")));
    assert_eq!(config.logging.level, "trace");
    assert_eq!(config.workers.concurrency, 2);

    env::remove_var(DATABASE_ENV);
    env::remove_var(LOG_LEVEL_ENV);
    env::remove_var(CONCURRENCY_ENV);
}

#[test]
#[serial]
fn test_env_concurrency_must_be_numeric() {
    env::set_var(CONCURRENCY_ENV, "many");

    let mut config = TomlConfig::default();
    let result = config.apply_env_overrides();
    assert!(matches!(result, Err(Error::Config(_))));

    env::remove_var(CONCURRENCY_ENV);
}

#[test]
#[serial]
fn test_root_folder_priority() {
    env::remove_var(ROOT_FOLDER_ENV);
    let config = TomlConfig::from_toml_str("root_folder = \"/from/toml\"\n").unwrap();

    // CLI wins over everything
    env::set_var(ROOT_FOLDER_ENV, "/from/env");
    assert_eq!(resolve_root_folder(Some("/from/cli"), Some(&config)), PathBuf::from("/from/cli"));

    // Environment wins over TOML
    assert_eq!(resolve_root_folder(None, Some(&config)), PathBuf::from("/from/env"));

    // TOML wins over the compiled default
    env::remove_var(ROOT_FOLDER_ENV);
    assert_eq!(resolve_root_folder(None, Some(&config)), PathBuf::from("/from/toml"));

    // Compiled default is never empty
    let default = resolve_root_folder(None, None);
    assert!(!default.as_os_str().is_empty());
    assert!(default.to_string_lossy().contains("parcelrec"));
}
