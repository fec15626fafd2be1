//! Hourly Parquet export.
//!
//! `export_hour` is the single entry point shared by the orchestrator and
//! the recovery service. It is idempotent per (table, hour): once a
//! verified object exists in cold storage, its stored metadata is
//! returned as authoritative and the source table is not re-read.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use common::config::ArchiveTableConfig;
use common::storage::archive_object_path;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::parquet::file::properties::{WriterProperties, WriterVersion};
use tracing::info;

use crate::db::{Database, HourWindow};
use crate::schema::{arrow_schema, build_record_batch};
use crate::uploader::{StorageUploader, StoredFileInfo, UploadMetadata};

/// Authoritative summary of one exported (table, hour) slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub record_count: i64,
    pub min_id: i64,
    pub max_id: i64,
    pub parquet_path: String,
    pub file_size: u64,
}

/// Three-way outcome of exporting one hour, consumed identically by the
/// orchestrator and the recovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// No rows in the window: no file, no job row needed.
    Empty,
    /// A verified object for this exact hour already exists; its stored
    /// metadata is returned without re-scanning the source table.
    Existing(ExportSummary),
    /// Rows were read in ascending primary-key order, written to a local
    /// temp file, uploaded and verified.
    Exported(ExportSummary),
}

impl ExportOutcome {
    pub fn summary(&self) -> Option<&ExportSummary> {
        match self {
            ExportOutcome::Empty => None,
            ExportOutcome::Existing(s) | ExportOutcome::Exported(s) => Some(s),
        }
    }
}

pub struct HourlyExporter {
    db: Database,
    uploader: Arc<StorageUploader>,
    environment: String,
    batch_size: i64,
}

impl HourlyExporter {
    pub fn new(
        db: Database,
        uploader: Arc<StorageUploader>,
        environment: String,
        batch_size: i64,
    ) -> Self {
        Self {
            db,
            uploader,
            environment,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn export_hour(
        &self,
        table: &ArchiveTableConfig,
        day: NaiveDate,
        hour: u32,
    ) -> Result<ExportOutcome> {
        let window = HourWindow::of(day, hour);
        let total = self
            .db
            .count_in_window(&table.name, &table.date_column, &window)
            .await?;
        if total == 0 {
            return Ok(ExportOutcome::Empty);
        }

        let path = archive_object_path(&self.environment, &table.name, day, hour);

        if let Some(existing) = self.uploader.check_existing(&path).await? {
            info!(
                table = %table.name,
                path = %path,
                record_count = existing.record_count,
                "Verified export already present, trusting stored metadata"
            );
            return Ok(ExportOutcome::Existing(summary_from(existing, &path)));
        }
        self.uploader.delete_if_invalid(&path).await?;

        if table.columns.is_empty() {
            anyhow::bail!("table {} has no export columns declared", table.name);
        }

        let temp = tempfile::Builder::new()
            .prefix(&format!("archive_{}_{}_{:02}_", table.name, day, hour))
            .suffix(".parquet")
            .tempfile()
            .context("failed to create local export file")?;

        let schema = arrow_schema(&table.columns);
        let props = WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .build();
        let mut writer = ArrowWriter::try_new(temp.reopen()?, schema.clone(), Some(props))
            .map_err(|e| anyhow::anyhow!("failed to create parquet writer: {e}"))?;

        let mut record_count: i64 = 0;
        let mut min_id = i64::MAX;
        let mut max_id = i64::MIN;
        let mut after_id = i64::MIN;

        loop {
            let rows = self
                .db
                .fetch_export_batch(table, &window, after_id, self.batch_size)
                .await?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                min_id = min_id.min(row.id);
                max_id = max_id.max(row.id);
            }
            record_count += rows.len() as i64;
            after_id = rows[rows.len() - 1].id;

            let batch = build_record_batch(&table.columns, &schema, &rows)?;
            writer
                .write(&batch)
                .map_err(|e| anyhow::anyhow!("failed to write parquet batch: {e}"))?;
        }

        writer
            .close()
            .map_err(|e| anyhow::anyhow!("failed to finish parquet file: {e}"))?;

        // The window can drain between the count and the scan
        if record_count == 0 {
            return Ok(ExportOutcome::Empty);
        }

        let metadata = UploadMetadata {
            table: table.name.clone(),
            record_count,
            min_id,
            max_id,
        };
        let file_size = self
            .uploader
            .upload_with_verification(temp.path(), &path, &metadata)
            .await?;

        info!(
            table = %table.name,
            path = %path,
            record_count,
            min_id,
            max_id,
            file_size,
            "Exported hour to cold storage"
        );

        Ok(ExportOutcome::Exported(ExportSummary {
            record_count,
            min_id,
            max_id,
            parquet_path: path,
            file_size,
        }))
    }
}

fn summary_from(info: StoredFileInfo, path: &str) -> ExportSummary {
    ExportSummary {
        record_count: info.record_count,
        min_id: info.min_id,
        max_id: info.max_id,
        parquet_path: path.to_string(),
        file_size: info.file_size,
    }
}
