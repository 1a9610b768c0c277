//! Shared domain models

pub mod parcel;

pub use parcel::{FieldChanges, FieldValue, ParcelField, ParcelRecord, ZonedByRight};
