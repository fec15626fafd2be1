//! Bounded deletion of archived rows.
//!
//! Deletion is intentionally not one large transaction: each batch is a
//! short-lived statement keyed by an ascending id cursor, so a crash
//! mid-deletion leaves a state the next pass re-identifies by id range.

use anyhow::Result;
use common::config::ArchiveTableConfig;
use tracing::{info, warn};

use crate::db::{Database, HourWindow};

pub struct TableCleaner {
    db: Database,
    batch_size: i64,
}

impl TableCleaner {
    pub fn new(db: Database, batch_size: i64) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Delete the rows covered by a verified export: both the time
    /// predicate and the id range must match.
    ///
    /// The live count is compared against the export's record count
    /// first; a disagreement is logged but does not stop the deletion —
    /// once the upload has been verified, the export is authoritative,
    /// and rows may legitimately already be gone from an earlier pass.
    pub async fn delete_archived_records(
        &self,
        table: &ArchiveTableConfig,
        min_id: i64,
        max_id: i64,
        expected_count: i64,
        window: &HourWindow,
    ) -> Result<i64> {
        let live = self
            .db
            .count_in_id_window(table, window, min_id, max_id)
            .await?;
        if live != expected_count {
            warn!(
                table = %table.name,
                expected = expected_count,
                found = live,
                "Live row count disagrees with verified export, proceeding anyway"
            );
        }

        let mut deleted: i64 = 0;
        let mut cursor = min_id.saturating_sub(1);

        loop {
            let (batch_deleted, last_id) = self
                .db
                .delete_batch_in_window(table, window, cursor, max_id, self.batch_size)
                .await?;
            if batch_deleted == 0 {
                break;
            }
            deleted += batch_deleted as i64;
            match last_id {
                Some(id) => cursor = id,
                None => break,
            }
        }

        info!(table = %table.name, deleted, "Deleted archived rows");
        Ok(deleted)
    }

    /// Delete purely by id range, without re-checking the time predicate.
    ///
    /// Used by recovery, where the window was proven correct in an
    /// earlier pass. `expected_count` is the export's record count; a
    /// shortfall means earlier passes already removed rows and is
    /// reported, not failed. Safe to call repeatedly: an already-empty
    /// range deletes nothing.
    pub async fn delete_by_id_range(
        &self,
        table_name: &str,
        id_column: &str,
        min_id: i64,
        max_id: i64,
        expected_count: i64,
    ) -> Result<i64> {
        let mut deleted: i64 = 0;
        let mut cursor = min_id.saturating_sub(1);

        while deleted < expected_count {
            let (batch_deleted, last_id) = self
                .db
                .delete_batch_by_id(table_name, id_column, cursor, max_id, self.batch_size)
                .await?;
            if batch_deleted == 0 {
                break;
            }
            deleted += batch_deleted as i64;
            match last_id {
                Some(id) => cursor = id,
                None => break,
            }
        }

        if deleted > 0 {
            info!(table = %table_name, deleted, min_id, max_id, "Id-range cleanup complete");
        }
        if deleted != expected_count {
            info!(
                table = %table_name,
                deleted,
                expected = expected_count,
                "Id-range deletion count differs from the export's record count"
            );
        }
        Ok(deleted)
    }

    /// Delete everything in a time window with no export, for purge-only
    /// tables.
    pub async fn delete_by_time_range(
        &self,
        table: &ArchiveTableConfig,
        window: &HourWindow,
    ) -> Result<i64> {
        let mut deleted: i64 = 0;
        let mut cursor = i64::MIN;

        loop {
            let (batch_deleted, last_id) = self
                .db
                .delete_batch_in_window(table, window, cursor, i64::MAX, self.batch_size)
                .await?;
            if batch_deleted == 0 {
                break;
            }
            deleted += batch_deleted as i64;
            match last_id {
                Some(id) => cursor = id,
                None => break,
            }
        }

        if deleted > 0 {
            info!(table = %table.name, deleted, "Purged rows without export");
        }
        Ok(deleted)
    }

    /// Best-effort compaction; failure is logged, never propagated.
    pub async fn vacuum(&self, table_name: &str) {
        match self.db.vacuum(table_name).await {
            Ok(()) => info!(table = %table_name, "VACUUM completed"),
            Err(e) => warn!(table = %table_name, error = %e, "VACUUM failed"),
        }
    }
}
