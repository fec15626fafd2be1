use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN of the operational database holding both the archived tables
    /// and the archive job ledger (PostgreSQL or SQLite).
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/archivedb.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DSN of the cold-storage object store (file://, memory://, s3://).
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file://.data/archive"),
        }
    }
}

/// Bounded exponential backoff settings shared by all network-calling steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Column types supported by the columnar export.
///
/// Timestamps are stored as RFC3339 TEXT on SQLite and TIMESTAMPTZ on
/// PostgreSQL; integers map to BIGINT.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    Text,
    Bool,
    Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// One operational table enrolled in the archival pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveTableConfig {
    pub name: String,
    /// Time column driving the hourly windows.
    pub date_column: String,
    /// Ascending primary key column.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Tables with `archive_to_parquet = false` are purge-only: old rows
    /// are deleted without a cold-storage copy.
    #[serde(default = "default_true")]
    pub archive_to_parquet: bool,
    /// Columns written to the Parquet export, in order.
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

fn default_id_column() -> String {
    String::from("id")
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiverConfig {
    pub enabled: bool,
    /// Environment discriminator namespacing cold-storage paths so test
    /// and production archives cannot collide.
    pub environment: String,
    /// Days of data kept live; the cutoff is midnight UTC this many days
    /// back. The default of 1 archives everything before yesterday 00:00.
    pub keep_days: i64,
    pub export_batch_size: i64,
    pub delete_batch_size: i64,
    /// Expiry for the per-table lease record in the job ledger.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    pub retry: RetryConfig,
    #[serde(default)]
    pub tables: Vec<ArchiveTableConfig>,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: String::from("dev"),
            keep_days: 1,
            export_batch_size: 2000,
            delete_batch_size: 2000,
            lease_ttl: Duration::from_secs(30 * 60),
            retry: RetryConfig::default(),
            tables: vec![],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub archiver: ArchiverConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("archivedb.toml"))
            .merge(Env::prefixed("ARCHIVEDB__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ARCHIVEDB__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();

        assert_eq!(config.database.dsn, "sqlite://.data/archivedb.db");
        assert_eq!(config.storage.dsn, "file://.data/archive");
        assert!(config.archiver.enabled);
        assert_eq!(config.archiver.environment, "dev");
        assert_eq!(config.archiver.keep_days, 1);
        assert_eq!(config.archiver.retry.max_attempts, 3);
        assert_eq!(config.archiver.retry.initial_backoff, Duration::from_secs(1));
        assert!(config.archiver.tables.is_empty());
    }

    #[test]
    fn test_table_config_from_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "archivedb.toml",
                r#"
                [archiver]
                environment = "prod"

                [[archiver.tables]]
                name = "conversation_events"
                date_column = "received_at"
                columns = [
                    { name = "id", type = "int" },
                    { name = "received_at", type = "timestamp" },
                    { name = "payload", type = "text" },
                ]

                [[archiver.tables]]
                name = "query_logs"
                date_column = "created_at"
                archive_to_parquet = false
                "#,
            )?;

            let config = Configuration::load().expect("config should parse");
            assert_eq!(config.archiver.environment, "prod");
            assert_eq!(config.archiver.tables.len(), 2);

            let events = &config.archiver.tables[0];
            assert_eq!(events.name, "conversation_events");
            assert_eq!(events.id_column, "id");
            assert!(events.archive_to_parquet);
            assert_eq!(events.columns.len(), 3);
            assert_eq!(events.columns[1].column_type, ColumnType::Timestamp);

            let logs = &config.archiver.tables[1];
            assert!(!logs.archive_to_parquet);
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("ARCHIVEDB__DATABASE__DSN", "sqlite://./test.db");
            jail.set_env("ARCHIVEDB__ARCHIVER__ENVIRONMENT", "prod");

            let config = Configuration::load().expect("config should parse");
            assert_eq!(config.database.dsn, "sqlite://./test.db");
            assert_eq!(config.archiver.environment, "prod");
            Ok(())
        });
    }
}
