//! # Parcelrec Common Library
//!
//! Shared code for the parcel reconciliation services:
//! - Error type and result alias
//! - Configuration loading and root folder resolution
//! - Canonical parcel model (ParcelRecord, ParcelField, FieldValue)
//! - Event types and the in-process EventBus
//! - Database initialization and schema migrations

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;

pub use error::{Error, Result};
pub use models::{FieldChanges, FieldValue, ParcelField, ParcelRecord, ZonedByRight};
