//! Scheduled archival runs.
//!
//! One run walks every enrolled table: it takes the table's ledger
//! lease, enumerates the UTC days older than the retention cutoff and
//! processes each day hour by hour through export, ledger upsert and
//! deletion. Hours already `completed` in the ledger are skipped, so a
//! rerun after a crash only touches outstanding work. Per-hour failures
//! are recorded and the run moves on; a failing hour never blocks the
//! rest of the backlog.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use common::config::{ArchiveTableConfig, ArchiverConfig};
use object_store::ObjectStore;
use tracing::{error, info, warn};

use crate::cleaner::TableCleaner;
use crate::db::{Database, HourWindow};
use crate::exporter::{ExportOutcome, HourlyExporter};
use crate::retry::RetryPolicy;
use crate::uploader::StorageUploader;

/// Per-table outcome of one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct TableRunResult {
    pub table_name: String,
    pub days_processed: usize,
    pub hours_completed: usize,
    pub hours_skipped: usize,
    pub records_archived: i64,
    pub records_deleted: i64,
    pub errors: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tables: Vec<TableRunResult>,
}

impl RunSummary {
    pub fn total_errors(&self) -> usize {
        self.tables.iter().map(|t| t.errors).sum()
    }
}

/// Pending work for one table, for the stats report.
#[derive(Debug, Clone)]
pub struct BacklogReport {
    pub table_name: String,
    pub pending_records: i64,
    pub pending_days: i64,
    pub oldest: Option<DateTime<Utc>>,
}

pub struct ArchiveOrchestrator {
    db: Database,
    exporter: HourlyExporter,
    cleaner: TableCleaner,
    config: ArchiverConfig,
    holder: String,
}

impl ArchiveOrchestrator {
    pub fn new(db: Database, store: Arc<dyn ObjectStore>, config: ArchiverConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        let uploader = Arc::new(StorageUploader::new(store, retry));
        let exporter = HourlyExporter::new(
            db.clone(),
            uploader,
            config.environment.clone(),
            config.export_batch_size,
        );
        let cleaner = TableCleaner::new(db.clone(), config.delete_batch_size);
        let holder = format!("archivedb-{}", std::process::id());
        Self {
            db,
            exporter,
            cleaner,
            config,
            holder,
        }
    }

    /// Midnight UTC `keep_days` back. Everything strictly before it is
    /// eligible for archival.
    pub fn cutoff(&self) -> DateTime<Utc> {
        Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc()
            - Duration::days(self.config.keep_days)
    }

    /// Archive every enrolled table's backlog. Table failures are
    /// isolated: one table erroring out does not stop the others.
    pub async fn run(&self) -> Result<RunSummary> {
        let cutoff = self.cutoff();
        info!(cutoff = %cutoff, tables = self.config.tables.len(), "Starting archival run");

        let mut summary = RunSummary::default();
        for table in &self.config.tables {
            match self.run_table(table, cutoff).await {
                Ok(result) => summary.tables.push(result),
                Err(e) => {
                    error!(table = %table.name, error = %format!("{e:#}"), "Table run failed");
                    summary.tables.push(TableRunResult {
                        table_name: table.name.clone(),
                        errors: 1,
                        ..Default::default()
                    });
                }
            }
        }

        info!(
            tables = summary.tables.len(),
            errors = summary.total_errors(),
            "Archival run finished"
        );
        Ok(summary)
    }

    async fn run_table(
        &self,
        table: &ArchiveTableConfig,
        cutoff: DateTime<Utc>,
    ) -> Result<TableRunResult> {
        let mut result = TableRunResult {
            table_name: table.name.clone(),
            ..Default::default()
        };

        if !self
            .db
            .try_acquire_lease(&table.name, &self.holder, self.config.lease_ttl)
            .await?
        {
            warn!(table = %table.name, "Lease held by another runner, skipping table");
            return Ok(result);
        }

        let outcome = self.process_table(table, cutoff, &mut result).await;
        self.db.release_lease(&table.name, &self.holder).await?;
        outcome?;

        Ok(result)
    }

    async fn process_table(
        &self,
        table: &ArchiveTableConfig,
        cutoff: DateTime<Utc>,
        result: &mut TableRunResult,
    ) -> Result<()> {
        let days = self
            .db
            .pending_days(&table.name, &table.date_column, cutoff)
            .await?;
        if days.is_empty() {
            info!(table = %table.name, "No backlog");
            return Ok(());
        }

        for day in days {
            // The cutoff is midnight UTC, so a pending day is always a
            // whole day before it
            if table.archive_to_parquet {
                self.archive_day(table, day, result).await;
            } else {
                let deleted = self
                    .cleaner
                    .delete_by_time_range(table, &HourWindow::day(day))
                    .await?;
                result.records_deleted += deleted;
            }
            result.days_processed += 1;
        }

        if result.records_deleted > 0 {
            self.cleaner.vacuum(&table.name).await;
        }
        Ok(())
    }

    async fn archive_day(
        &self,
        table: &ArchiveTableConfig,
        day: chrono::NaiveDate,
        result: &mut TableRunResult,
    ) {
        for hour in 0..24u32 {
            if let Err(e) = self.archive_hour(table, day, hour, result).await {
                result.errors += 1;
                let message = format!("{e:#}");
                error!(
                    table = %table.name,
                    day = %day,
                    hour,
                    error = %message,
                    "Hour failed, continuing with the rest of the backlog"
                );
                let date_hour = HourWindow::of(day, hour).start;
                if let Ok(Some(job)) = self.db.get_job(&table.name, date_hour).await {
                    if let Err(e) = self
                        .db
                        .mark_error(&table.name, date_hour, job.records_deleted, &message)
                        .await
                    {
                        warn!(table = %table.name, error = %e, "Failed to record hour error");
                    }
                }
            }
        }
    }

    async fn archive_hour(
        &self,
        table: &ArchiveTableConfig,
        day: chrono::NaiveDate,
        hour: u32,
        result: &mut TableRunResult,
    ) -> Result<()> {
        let window = HourWindow::of(day, hour);
        if self.db.is_hour_completed(&table.name, window.start).await? {
            result.hours_skipped += 1;
            return Ok(());
        }

        let outcome = self.exporter.export_hour(table, day, hour).await?;
        let Some(summary) = outcome.summary() else {
            return Ok(());
        };
        let reused = matches!(outcome, ExportOutcome::Existing(_));

        self.db
            .record_exported(&table.name, window.start, summary)
            .await?;

        let deleted = self
            .cleaner
            .delete_archived_records(
                table,
                summary.min_id,
                summary.max_id,
                summary.record_count,
                &window,
            )
            .await?;

        result.records_archived += summary.record_count;
        result.records_deleted += deleted;

        // Rows may already be gone from an interrupted earlier pass, so
        // judge completion by what remains, not by this pass's count
        let remaining = self
            .db
            .count_by_id_range(&table.name, &table.id_column, summary.min_id, summary.max_id)
            .await?;
        if remaining == 0 {
            // An empty range proves every archived row is gone, even if
            // some were already deleted by an interrupted earlier pass
            self.db
                .mark_completed(&table.name, window.start, summary.record_count)
                .await?;
            result.hours_completed += 1;
            info!(
                table = %table.name,
                day = %day,
                hour,
                records = summary.record_count,
                deleted,
                reused_existing_export = reused,
                "Hour archived"
            );
            Ok(())
        } else {
            anyhow::bail!(
                "{remaining} rows of id range [{}, {}] still live after deletion",
                summary.min_id,
                summary.max_id
            );
        }
    }

    /// Pending-work summary per table, without touching anything.
    pub async fn backlog_report(&self) -> Result<Vec<BacklogReport>> {
        let cutoff = self.cutoff();
        let mut reports = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            let (pending_records, pending_days, oldest) = self
                .db
                .backlog(&table.name, &table.date_column, cutoff)
                .await?;
            reports.push(BacklogReport {
                table_name: table.name.clone(),
                pending_records,
                pending_days,
                oldest,
            });
        }
        Ok(reports)
    }
}
