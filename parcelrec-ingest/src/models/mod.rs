//! Data models for the ingest service

pub mod audit_entry;
pub mod foia_update;
pub mod import_session;
pub mod session_summary;
pub mod source_record;

pub use audit_entry::{AuditLogEntry, AuditOperation, PARCELS_TABLE};
pub use foia_update::{AddressMatch, FoiaUpdate, MatchType, UpdateStatus};
pub use import_session::{ImportSession, SessionStatus, StatusTransition};
pub use session_summary::{ReviewItem, SessionSummary};
pub use source_record::SourceRecord;
