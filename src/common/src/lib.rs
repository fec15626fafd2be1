pub mod config;
pub mod storage;

pub use config::{ArchiveTableConfig, ArchiverConfig, ColumnSpec, ColumnType, Configuration};
pub use storage::{archive_object_path, create_object_store_from_dsn};
