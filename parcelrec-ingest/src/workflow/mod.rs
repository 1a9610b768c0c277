//! Import workflow orchestration

pub mod import_pipeline;

pub use import_pipeline::{prepare, ImportOutcome, ImportPipeline, PreparedRecord, RecordError};
