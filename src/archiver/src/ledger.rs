//! Archive job ledger.
//!
//! One row per (table, hour) tracks the slice's lifecycle. A job is
//! created the moment upload verification succeeds (status `exported`),
//! advanced to `completed` once deletion is confirmed, and moved to
//! `error` with a diagnostic message on unrecoverable failure. Jobs are
//! never deleted: a non-terminal job is the sole source of truth for
//! what work remains.
//!
//! The ledger also holds the per-table lease records that keep two
//! orchestrator runs on the same ledger database from double-running a
//! table.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, query};
use std::time::Duration;

use crate::db::Database;
use crate::exporter::ExportSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Exported,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Exported => "exported",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "exported" => Ok(JobStatus::Exported),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            other => Err(anyhow::anyhow!("unknown job status {other:?}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

/// Persisted lifecycle record for one table's one-hour slice.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub table_name: String,
    pub date_hour: DateTime<Utc>,
    pub record_count: i64,
    pub min_id: i64,
    pub max_id: i64,
    pub parquet_path: Option<String>,
    pub file_size: i64,
    pub status: JobStatus,
    pub records_archived: i64,
    pub records_deleted: i64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Database {
    /// Create the ledger tables if they do not exist.
    pub(crate) async fn init_ledger_schema(&self) -> Result<()> {
        match self {
            Database::Sqlite(pool) => {
                let create_jobs = r#"
                CREATE TABLE IF NOT EXISTS archive_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    table_name TEXT NOT NULL,
                    date_hour TEXT NOT NULL,
                    record_count INTEGER NOT NULL DEFAULT 0,
                    min_id INTEGER NOT NULL DEFAULT 0,
                    max_id INTEGER NOT NULL DEFAULT 0,
                    parquet_path TEXT,
                    file_size INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    records_archived INTEGER NOT NULL DEFAULT 0,
                    records_deleted INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    UNIQUE (table_name, date_hour)
                )"#;
                query(create_jobs).execute(pool).await?;

                let create_leases = r#"
                CREATE TABLE IF NOT EXISTS archive_leases (
                    table_name TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                )"#;
                query(create_leases).execute(pool).await?;
            }
            Database::Postgres(pool) => {
                let create_jobs = r#"
                CREATE TABLE IF NOT EXISTS archive_jobs (
                    id BIGSERIAL PRIMARY KEY,
                    table_name TEXT NOT NULL,
                    date_hour TIMESTAMPTZ NOT NULL,
                    record_count BIGINT NOT NULL DEFAULT 0,
                    min_id BIGINT NOT NULL DEFAULT 0,
                    max_id BIGINT NOT NULL DEFAULT 0,
                    parquet_path TEXT,
                    file_size BIGINT NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    records_archived BIGINT NOT NULL DEFAULT 0,
                    records_deleted BIGINT NOT NULL DEFAULT 0,
                    error_message TEXT,
                    started_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    UNIQUE (table_name, date_hour)
                )"#;
                query(create_jobs).execute(pool).await?;

                let create_leases = r#"
                CREATE TABLE IF NOT EXISTS archive_leases (
                    table_name TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL
                )"#;
                query(create_leases).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Idempotent upsert recording a verified export. An existing row
    /// keeps its accumulated `records_deleted`; everything derived from
    /// the export is refreshed from the verified summary.
    pub async fn record_exported(
        &self,
        table_name: &str,
        date_hour: DateTime<Utc>,
        summary: &ExportSummary,
    ) -> Result<()> {
        let now = Utc::now();
        match self {
            Database::Sqlite(pool) => {
                let insert = r#"
                INSERT INTO archive_jobs
                    (table_name, date_hour, record_count, min_id, max_id, parquet_path,
                     file_size, status, records_archived, records_deleted, error_message, started_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'exported', ?, 0, NULL, ?)
                "#;
                let result = query(insert)
                    .bind(table_name)
                    .bind(date_hour.to_rfc3339())
                    .bind(summary.record_count)
                    .bind(summary.min_id)
                    .bind(summary.max_id)
                    .bind(&summary.parquet_path)
                    .bind(summary.file_size as i64)
                    .bind(summary.record_count)
                    .bind(now.to_rfc3339())
                    .execute(pool)
                    .await;

                if result.is_err() {
                    let update = r#"
                    UPDATE archive_jobs
                    SET record_count = ?, min_id = ?, max_id = ?, parquet_path = ?,
                        file_size = ?, status = 'exported', records_archived = ?,
                        error_message = NULL
                    WHERE table_name = ? AND date_hour = ?
                    "#;
                    query(update)
                        .bind(summary.record_count)
                        .bind(summary.min_id)
                        .bind(summary.max_id)
                        .bind(&summary.parquet_path)
                        .bind(summary.file_size as i64)
                        .bind(summary.record_count)
                        .bind(table_name)
                        .bind(date_hour.to_rfc3339())
                        .execute(pool)
                        .await?;
                }
            }
            Database::Postgres(pool) => {
                let stmt = r#"
                INSERT INTO archive_jobs
                    (table_name, date_hour, record_count, min_id, max_id, parquet_path,
                     file_size, status, records_archived, records_deleted, error_message, started_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'exported', $3, 0, NULL, $8)
                ON CONFLICT (table_name, date_hour) DO UPDATE SET
                    record_count = EXCLUDED.record_count,
                    min_id = EXCLUDED.min_id,
                    max_id = EXCLUDED.max_id,
                    parquet_path = EXCLUDED.parquet_path,
                    file_size = EXCLUDED.file_size,
                    status = 'exported',
                    records_archived = EXCLUDED.records_archived,
                    error_message = NULL
                "#;
                query(stmt)
                    .bind(table_name)
                    .bind(date_hour)
                    .bind(summary.record_count)
                    .bind(summary.min_id)
                    .bind(summary.max_id)
                    .bind(&summary.parquet_path)
                    .bind(summary.file_size as i64)
                    .bind(now)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Advance a job to `completed` with its final deletion count.
    pub async fn mark_completed(
        &self,
        table_name: &str,
        date_hour: DateTime<Utc>,
        records_deleted: i64,
    ) -> Result<()> {
        let now = Utc::now();
        match self {
            Database::Sqlite(pool) => {
                let stmt = r#"
                UPDATE archive_jobs
                SET status = 'completed', records_deleted = ?, error_message = NULL, completed_at = ?
                WHERE table_name = ? AND date_hour = ?
                "#;
                query(stmt)
                    .bind(records_deleted)
                    .bind(now.to_rfc3339())
                    .bind(table_name)
                    .bind(date_hour.to_rfc3339())
                    .execute(pool)
                    .await?;
            }
            Database::Postgres(pool) => {
                let stmt = r#"
                UPDATE archive_jobs
                SET status = 'completed', records_deleted = $1, error_message = NULL, completed_at = $2
                WHERE table_name = $3 AND date_hour = $4
                "#;
                query(stmt)
                    .bind(records_deleted)
                    .bind(now)
                    .bind(table_name)
                    .bind(date_hour)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Record a non-terminal failure with its diagnostic, updating the
    /// running deletion total.
    pub async fn mark_error(
        &self,
        table_name: &str,
        date_hour: DateTime<Utc>,
        records_deleted: i64,
        message: &str,
    ) -> Result<()> {
        match self {
            Database::Sqlite(pool) => {
                let stmt = r#"
                UPDATE archive_jobs
                SET status = 'error', records_deleted = ?, error_message = ?
                WHERE table_name = ? AND date_hour = ?
                "#;
                query(stmt)
                    .bind(records_deleted)
                    .bind(message)
                    .bind(table_name)
                    .bind(date_hour.to_rfc3339())
                    .execute(pool)
                    .await?;
            }
            Database::Postgres(pool) => {
                let stmt = r#"
                UPDATE archive_jobs
                SET status = 'error', records_deleted = $1, error_message = $2
                WHERE table_name = $3 AND date_hour = $4
                "#;
                query(stmt)
                    .bind(records_deleted)
                    .bind(message)
                    .bind(table_name)
                    .bind(date_hour)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Look up one job by its composite key.
    pub async fn get_job(
        &self,
        table_name: &str,
        date_hour: DateTime<Utc>,
    ) -> Result<Option<ArchiveJob>> {
        match self {
            Database::Sqlite(pool) => {
                let stmt = r#"
                SELECT table_name, date_hour, record_count, min_id, max_id, parquet_path,
                       file_size, status, records_archived, records_deleted, error_message,
                       started_at, completed_at
                FROM archive_jobs WHERE table_name = ? AND date_hour = ?
                "#;
                let row = query(stmt)
                    .bind(table_name)
                    .bind(date_hour.to_rfc3339())
                    .fetch_optional(pool)
                    .await?;
                row.map(job_from_sqlite_row).transpose()
            }
            Database::Postgres(pool) => {
                let stmt = r#"
                SELECT table_name, date_hour, record_count, min_id, max_id, parquet_path,
                       file_size, status, records_archived, records_deleted, error_message,
                       started_at, completed_at
                FROM archive_jobs WHERE table_name = $1 AND date_hour = $2
                "#;
                let row = query(stmt)
                    .bind(table_name)
                    .bind(date_hour)
                    .fetch_optional(pool)
                    .await?;
                row.map(job_from_pg_row).transpose()
            }
        }
    }

    /// Whether the hour is already `completed` and can be skipped.
    pub async fn is_hour_completed(
        &self,
        table_name: &str,
        date_hour: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .get_job(table_name, date_hour)
            .await?
            .is_some_and(|job| job.status.is_terminal()))
    }

    /// Distinct UTC days of a table with at least one non-terminal job,
    /// oldest first. These are the days the recovery service reconciles.
    pub async fn non_terminal_days(&self, table_name: &str) -> Result<Vec<NaiveDate>> {
        match self {
            Database::Sqlite(pool) => {
                let stmt = r#"
                SELECT DISTINCT substr(date_hour, 1, 10) AS day
                FROM archive_jobs
                WHERE table_name = ? AND status != 'completed'
                ORDER BY day ASC
                "#;
                let rows = query(stmt).bind(table_name).fetch_all(pool).await?;
                let mut days = Vec::with_capacity(rows.len());
                for row in rows {
                    let text: String = row.get("day");
                    days.push(
                        NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                            .map_err(|e| anyhow::anyhow!("invalid ledger day {text:?}: {e}"))?,
                    );
                }
                Ok(days)
            }
            Database::Postgres(pool) => {
                let stmt = r#"
                SELECT DISTINCT (date_hour AT TIME ZONE 'UTC')::date AS day
                FROM archive_jobs
                WHERE table_name = $1 AND status != 'completed'
                ORDER BY day ASC
                "#;
                let rows = query(stmt).bind(table_name).fetch_all(pool).await?;
                Ok(rows.iter().map(|row| row.get::<NaiveDate, _>("day")).collect())
            }
        }
    }

    /// All jobs of one table whose hour falls on the given UTC day.
    pub async fn jobs_for_day(&self, table_name: &str, day: NaiveDate) -> Result<Vec<ArchiveJob>> {
        match self {
            Database::Sqlite(pool) => {
                let stmt = r#"
                SELECT table_name, date_hour, record_count, min_id, max_id, parquet_path,
                       file_size, status, records_archived, records_deleted, error_message,
                       started_at, completed_at
                FROM archive_jobs
                WHERE table_name = ? AND substr(date_hour, 1, 10) = ?
                ORDER BY date_hour ASC
                "#;
                let rows = query(stmt)
                    .bind(table_name)
                    .bind(day.format("%Y-%m-%d").to_string())
                    .fetch_all(pool)
                    .await?;
                rows.into_iter().map(job_from_sqlite_row).collect()
            }
            Database::Postgres(pool) => {
                let stmt = r#"
                SELECT table_name, date_hour, record_count, min_id, max_id, parquet_path,
                       file_size, status, records_archived, records_deleted, error_message,
                       started_at, completed_at
                FROM archive_jobs
                WHERE table_name = $1 AND (date_hour AT TIME ZONE 'UTC')::date = $2
                ORDER BY date_hour ASC
                "#;
                let rows = query(stmt)
                    .bind(table_name)
                    .bind(day)
                    .fetch_all(pool)
                    .await?;
                rows.into_iter().map(job_from_pg_row).collect()
            }
        }
    }

    /// Acquire (or refresh) the processing lease for a table. Returns
    /// false when another live holder owns it. Expired leases are
    /// reclaimed. Best-effort only; see the open question on distributed
    /// locking.
    pub async fn try_acquire_lease(
        &self,
        table_name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(ttl)?;

        match self {
            Database::Sqlite(pool) => {
                query("DELETE FROM archive_leases WHERE table_name = ? AND expires_at < ?")
                    .bind(table_name)
                    .bind(now.to_rfc3339())
                    .execute(pool)
                    .await?;

                let inserted = query(
                    "INSERT OR IGNORE INTO archive_leases (table_name, holder, expires_at) VALUES (?, ?, ?)",
                )
                .bind(table_name)
                .bind(holder)
                .bind(expires.to_rfc3339())
                .execute(pool)
                .await?;
                if inserted.rows_affected() > 0 {
                    return Ok(true);
                }

                let refreshed = query(
                    "UPDATE archive_leases SET expires_at = ? WHERE table_name = ? AND holder = ?",
                )
                .bind(expires.to_rfc3339())
                .bind(table_name)
                .bind(holder)
                .execute(pool)
                .await?;
                Ok(refreshed.rows_affected() > 0)
            }
            Database::Postgres(pool) => {
                query("DELETE FROM archive_leases WHERE table_name = $1 AND expires_at < $2")
                    .bind(table_name)
                    .bind(now)
                    .execute(pool)
                    .await?;

                let inserted = query(
                    "INSERT INTO archive_leases (table_name, holder, expires_at) VALUES ($1, $2, $3) \
                     ON CONFLICT (table_name) DO NOTHING",
                )
                .bind(table_name)
                .bind(holder)
                .bind(expires)
                .execute(pool)
                .await?;
                if inserted.rows_affected() > 0 {
                    return Ok(true);
                }

                let refreshed = query(
                    "UPDATE archive_leases SET expires_at = $1 WHERE table_name = $2 AND holder = $3",
                )
                .bind(expires)
                .bind(table_name)
                .bind(holder)
                .execute(pool)
                .await?;
                Ok(refreshed.rows_affected() > 0)
            }
        }
    }

    pub async fn release_lease(&self, table_name: &str, holder: &str) -> Result<()> {
        match self {
            Database::Sqlite(pool) => {
                query("DELETE FROM archive_leases WHERE table_name = ? AND holder = ?")
                    .bind(table_name)
                    .bind(holder)
                    .execute(pool)
                    .await?;
            }
            Database::Postgres(pool) => {
                query("DELETE FROM archive_leases WHERE table_name = $1 AND holder = $2")
                    .bind(table_name)
                    .bind(holder)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }
}

fn job_from_sqlite_row(row: sqlx::sqlite::SqliteRow) -> Result<ArchiveJob> {
    let parse_ts = |text: String| -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(&text)
            .map_err(|e| anyhow::anyhow!("invalid ledger timestamp {text:?}: {e}"))?
            .with_timezone(&Utc))
    };

    let status_text: String = row.get("status");
    let completed_at = row
        .get::<Option<String>, _>("completed_at")
        .map(parse_ts)
        .transpose()?;

    Ok(ArchiveJob {
        table_name: row.get("table_name"),
        date_hour: parse_ts(row.get("date_hour"))?,
        record_count: row.get("record_count"),
        min_id: row.get("min_id"),
        max_id: row.get("max_id"),
        parquet_path: row.get("parquet_path"),
        file_size: row.get("file_size"),
        status: JobStatus::parse(&status_text)?,
        records_archived: row.get("records_archived"),
        records_deleted: row.get("records_deleted"),
        error_message: row.get("error_message"),
        started_at: parse_ts(row.get("started_at"))?,
        completed_at,
    })
}

fn job_from_pg_row(row: sqlx::postgres::PgRow) -> Result<ArchiveJob> {
    let status_text: String = row.get("status");
    Ok(ArchiveJob {
        table_name: row.get("table_name"),
        date_hour: row.get("date_hour"),
        record_count: row.get("record_count"),
        min_id: row.get("min_id"),
        max_id: row.get("max_id"),
        parquet_path: row.get("parquet_path"),
        file_size: row.get("file_size"),
        status: JobStatus::parse(&status_text)?,
        records_archived: row.get("records_archived"),
        records_deleted: row.get("records_deleted"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // File-backed: a pooled in-memory sqlite hands each connection its
    // own empty database
    async fn test_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("ledger.db").display());
        (Database::connect(&dsn).await.unwrap(), dir)
    }

    fn summary(count: i64) -> ExportSummary {
        ExportSummary {
            record_count: count,
            min_id: 1,
            max_id: count,
            parquet_path: "archives/dev/events/2024-01-01/03.parquet".to_string(),
            file_size: 1024,
        }
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_exported_then_complete() {
        let (db, _dir) = test_db().await;
        db.record_exported("events", hour(3), &summary(500)).await.unwrap();

        let job = db.get_job("events", hour(3)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Exported);
        assert_eq!(job.record_count, 500);
        assert_eq!(job.records_archived, 500);
        assert_eq!(job.records_deleted, 0);
        assert!(!db.is_hour_completed("events", hour(3)).await.unwrap());

        db.mark_completed("events", hour(3), 500).await.unwrap();
        let job = db.get_job("events", hour(3)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.records_deleted, 500);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());
        assert!(db.is_hour_completed("events", hour(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_keeps_deletions() {
        let (db, _dir) = test_db().await;
        db.record_exported("events", hour(3), &summary(500)).await.unwrap();
        db.mark_error("events", hour(3), 200, "deletion interrupted").await.unwrap();

        // Re-recording the same verified export must not lose the
        // accumulated deletion count
        db.record_exported("events", hour(3), &summary(500)).await.unwrap();
        let job = db.get_job("events", hour(3)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Exported);
        assert_eq!(job.records_deleted, 200);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_non_terminal_days() {
        let (db, _dir) = test_db().await;
        db.record_exported("events", hour(3), &summary(10)).await.unwrap();
        db.record_exported("events", hour(5), &summary(20)).await.unwrap();
        db.mark_completed("events", hour(5), 20).await.unwrap();

        let other_day = Utc.with_ymd_and_hms(2024, 1, 2, 7, 0, 0).unwrap();
        db.record_exported("events", other_day, &summary(30)).await.unwrap();
        db.mark_error("events", other_day, 0, "boom").await.unwrap();

        let days = db.non_terminal_days("events").await.unwrap();
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            ]
        );

        let jobs = db
            .jobs_for_day("events", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_lease_blocks_second_holder() {
        let (db, _dir) = test_db().await;
        let ttl = Duration::from_secs(60);

        assert!(db.try_acquire_lease("events", "runner-a", ttl).await.unwrap());
        assert!(!db.try_acquire_lease("events", "runner-b", ttl).await.unwrap());
        // Same holder refreshes its own lease
        assert!(db.try_acquire_lease("events", "runner-a", ttl).await.unwrap());

        db.release_lease("events", "runner-a").await.unwrap();
        assert!(db.try_acquire_lease("events", "runner-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (db, _dir) = test_db().await;
        assert!(
            db.try_acquire_lease("events", "dead-runner", Duration::from_millis(0))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(db.try_acquire_lease("events", "runner-b", Duration::from_secs(60)).await.unwrap());
    }
}
