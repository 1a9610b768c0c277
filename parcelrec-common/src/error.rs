//! Common error types for parcel reconciliation

use thiserror::Error;

/// Common result type for parcelrec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across parcelrec crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of stored values or input records
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Address text is empty or contains no alphanumeric characters.
    /// The record is skipped and never retried.
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    /// Parcel lock could not be acquired in time
    #[error("Write conflict on parcel {parcel_id} after {attempts} attempt(s)")]
    WriteConflict { parcel_id: i64, attempts: u32 },

    /// Storage backend failed to read or write
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Session status change not permitted by the lifecycle
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl Error {
    /// Whether retrying the same operation may succeed.
    ///
    /// Lock contention (our own per-parcel lock, or SQLite's file lock) is
    /// transient; everything else is returned to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::WriteConflict { .. } => true,
            Error::Database(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_conflict_is_retryable() {
        let err = Error::WriteConflict { parcel_id: 7, attempts: 1 };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Write conflict on parcel 7 after 1 attempt(s)");
    }

    #[test]
    fn test_other_errors_not_retryable() {
        assert!(!Error::InvalidAddress(String::new()).is_retryable());
        assert!(!Error::StorageFailure("disk".into()).is_retryable());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_retryable());
    }
}
