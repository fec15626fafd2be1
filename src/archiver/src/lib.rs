//! ArchiveDB archival pipeline
//!
//! Moves old rows out of high-volume operational tables into Parquet
//! objects in cold storage, one (table, hour) slice at a time:
//!
//! - export the hour in ascending primary-key order to a local temp file
//! - upload with independent metadata verification and atomic promotion
//! - delete the verified id range from the live table in bounded batches
//! - record every step in the archive job ledger
//!
//! A row is never deleted before its cold-storage copy has been verified,
//! and a crash mid-run is reconciled by the recovery service on the next
//! run using the same exporter and cleaner primitives.

pub mod cleaner;
pub mod db;
pub mod exporter;
pub mod ledger;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod schema;
pub mod uploader;

// Re-export commonly used types
pub use cleaner::TableCleaner;
pub use db::{Database, HourWindow};
pub use exporter::{ExportOutcome, ExportSummary, HourlyExporter};
pub use ledger::{ArchiveJob, JobStatus};
pub use orchestrator::{ArchiveOrchestrator, BacklogReport, RunSummary, TableRunResult};
pub use recovery::{DayRecoveryResult, RecoveryService};
pub use retry::RetryPolicy;
pub use uploader::{StorageUploader, StoredFileInfo, UploadMetadata};
