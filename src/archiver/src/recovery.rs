//! Crash recovery.
//!
//! Runs before the scheduled archival pass and reconciles every day that
//! still has a non-terminal ledger job. Each of the day's 24 hours is
//! re-driven through the same exporter and cleaner primitives the
//! orchestrator uses; both are idempotent, so re-driving an hour that
//! already finished is free.
//!
//! A day is promoted to completed only when all 24 hours verify, no hour
//! failed, and the deletions accounted for cover everything archived.
//! Anything less leaves the day's jobs non-terminal with an error
//! message naming the outstanding hours, to be retried on the next run.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Timelike};
use common::config::{ArchiveTableConfig, ArchiverConfig};
use object_store::ObjectStore;
use tracing::{error, info, warn};

use crate::cleaner::TableCleaner;
use crate::db::{Database, HourWindow};
use crate::exporter::HourlyExporter;
use crate::ledger::ArchiveJob;
use crate::retry::RetryPolicy;
use crate::uploader::StorageUploader;

/// Outcome of reconciling one (table, day).
#[derive(Debug, Clone)]
pub struct DayRecoveryResult {
    pub table_name: String,
    pub day: NaiveDate,
    pub hours_verified: usize,
    pub records_archived: i64,
    pub records_deleted: i64,
    pub promoted: bool,
    /// Hours that could not be verified, with the reason.
    pub failures: Vec<(u32, String)>,
}

pub struct RecoveryService {
    db: Database,
    exporter: HourlyExporter,
    cleaner: TableCleaner,
    config: ArchiverConfig,
    holder: String,
}

impl RecoveryService {
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

    /// Reconcile all days with non-terminal jobs across every enrolled
    /// table. Purge-only tables keep no ledger jobs and are skipped.
    pub async fn run(&self) -> Result<Vec<DayRecoveryResult>> {
        let mut results = Vec::new();
        for table in &self.config.tables {
            if !table.archive_to_parquet {
                continue;
            }

            if !self
                .db
                .try_acquire_lease(&table.name, &self.holder, self.config.lease_ttl)
                .await?
            {
                warn!(table = %table.name, "Lease held by another runner, skipping recovery");
                continue;
            }

            let outcome = self.reconcile_table(table, &mut results).await;
            self.db.release_lease(&table.name, &self.holder).await?;
            outcome?;
        }
        Ok(results)
    }

    async fn reconcile_table(
        &self,
        table: &ArchiveTableConfig,
        results: &mut Vec<DayRecoveryResult>,
    ) -> Result<()> {
        let days = self.db.non_terminal_days(&table.name).await?;
        if !days.is_empty() {
            info!(
                table = %table.name,
                days = days.len(),
                "Found interrupted archival days, reconciling"
            );
        }
        for day in days {
            results.push(self.recover_day(table, day).await?);
        }
        Ok(())
    }

    async fn recover_day(
        &self,
        table: &ArchiveTableConfig,
        day: NaiveDate,
    ) -> Result<DayRecoveryResult> {
        let mut result = DayRecoveryResult {
            table_name: table.name.clone(),
            day,
            hours_verified: 0,
            records_archived: 0,
            records_deleted: 0,
            promoted: false,
            failures: Vec::new(),
        };
        // Deletion totals per reconciled hour, for the ledger update
        let mut deleted_by_hour: HashMap<u32, i64> = HashMap::new();

        for hour in 0..24u32 {
            match self.recover_hour(table, day, hour).await {
                Ok(Some((archived, deleted))) => {
                    result.hours_verified += 1;
                    result.records_archived += archived;
                    result.records_deleted += deleted;
                    deleted_by_hour.insert(hour, deleted);
                }
                Ok(None) => result.hours_verified += 1,
                Err(e) => result.failures.push((hour, format!("{e:#}"))),
            }
        }

        let jobs = self.db.jobs_for_day(&table.name, day).await?;
        let open_jobs: Vec<&ArchiveJob> = jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .collect();

        let all_accounted = result.hours_verified == 24
            && result.failures.is_empty()
            && result.records_deleted >= result.records_archived;

        if all_accounted {
            for job in &open_jobs {
                let deleted = deleted_by_hour
                    .get(&job.date_hour.hour())
                    .copied()
                    .unwrap_or(job.records_archived);
                self.db
                    .mark_completed(&table.name, job.date_hour, deleted)
                    .await?;
            }
            result.promoted = true;
            info!(
                table = %table.name,
                day = %day,
                jobs = open_jobs.len(),
                archived = result.records_archived,
                deleted = result.records_deleted,
                "Day reconciled, all jobs completed"
            );
        } else {
            let outstanding: Vec<String> = result
                .failures
                .iter()
                .map(|(hour, reason)| format!("{hour:02} ({reason})"))
                .collect();
            let message = if outstanding.is_empty() {
                format!(
                    "recovery incomplete: deleted {} of {} archived rows",
                    result.records_deleted, result.records_archived
                )
            } else {
                format!("recovery incomplete, outstanding hours: {}", outstanding.join(", "))
            };
            error!(table = %table.name, day = %day, message = %message, "Day left non-terminal");

            for job in &open_jobs {
                let deleted = deleted_by_hour
                    .get(&job.date_hour.hour())
                    .copied()
                    .unwrap_or(job.records_deleted);
                self.db
                    .mark_error(&table.name, job.date_hour, deleted, &message)
                    .await?;
            }
        }

        Ok(result)
    }

    /// Re-drive one hour to a verified state. Returns the hour's
    /// (archived, deleted) totals, or `None` for an hour with nothing
    /// archived and nothing live.
    async fn recover_hour(
        &self,
        table: &ArchiveTableConfig,
        day: NaiveDate,
        hour: u32,
    ) -> Result<Option<(i64, i64)>> {
        let date_hour = HourWindow::of(day, hour).start;
        let job = self.db.get_job(&table.name, date_hour).await?;
        if job.as_ref().is_some_and(|j| j.status.is_terminal()) {
            return Ok(None);
        }

        let outcome = self.exporter.export_hour(table, day, hour).await?;
        if let Some(summary) = outcome.summary() {
            // Live rows remained: make sure the verified export covers
            // them, record it, then delete its id range
            self.db
                .record_exported(&table.name, date_hour, summary)
                .await?;
            let deleted_now = self
                .cleaner
                .delete_by_id_range(
                    &table.name,
                    &table.id_column,
                    summary.min_id,
                    summary.max_id,
                    summary.record_count,
                )
                .await?;
            let remaining = self
                .db
                .count_by_id_range(&table.name, &table.id_column, summary.min_id, summary.max_id)
                .await?;
            if remaining > 0 {
                anyhow::bail!(
                    "{remaining} rows of id range [{}, {}] still live after recovery deletion",
                    summary.min_id,
                    summary.max_id
                );
            }
            // Deletions from interrupted earlier passes are already on
            // the job's running total
            let prior = job.as_ref().map_or(0, |j| j.records_deleted);
            return Ok(Some((summary.record_count, prior + deleted_now)));
        }

        // No live rows in the window. A non-terminal job here means the
        // export was verified and deletion finished, but the completion
        // was never recorded; account for it by what remains of its id
        // range.
        match job {
            Some(job) if job.min_id > 0 && job.max_id > 0 => {
                let remaining = self
                    .db
                    .count_by_id_range(&table.name, &table.id_column, job.min_id, job.max_id)
                    .await?;
                if remaining > 0 {
                    anyhow::bail!(
                        "{remaining} rows of id range [{}, {}] live outside the hour window",
                        job.min_id,
                        job.max_id
                    );
                }
                Ok(Some((job.records_archived, job.records_archived)))
            }
            _ => Ok(None),
        }
    }
}
