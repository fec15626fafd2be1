//! End-to-end pipeline tests over a file-backed SQLite database and an
//! in-memory object store.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use archiver::{
    ArchiveOrchestrator, Database, ExportOutcome, HourWindow, HourlyExporter, JobStatus,
    RecoveryService, RetryPolicy, StorageUploader, TableCleaner, UploadMetadata,
};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use common::config::{ArchiveTableConfig, ArchiverConfig, ColumnSpec, ColumnType, RetryConfig};
use common::storage::archive_object_path;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Attribute, GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOptions, PutOptions, PutPayload, PutResult,
};

const TABLE: &str = "conversation_events";

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn table_config() -> ArchiveTableConfig {
    ArchiveTableConfig {
        name: TABLE.to_string(),
        date_column: "received_at".to_string(),
        id_column: "id".to_string(),
        archive_to_parquet: true,
        columns: vec![
            ColumnSpec {
                name: "id".to_string(),
                column_type: ColumnType::Int,
            },
            ColumnSpec {
                name: "received_at".to_string(),
                column_type: ColumnType::Timestamp,
            },
            ColumnSpec {
                name: "payload".to_string(),
                column_type: ColumnType::Text,
            },
        ],
    }
}

fn retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    }
}

fn archiver_config() -> ArchiverConfig {
    ArchiverConfig {
        enabled: true,
        environment: "test".to_string(),
        keep_days: 1,
        export_batch_size: 100,
        delete_batch_size: 100,
        lease_ttl: Duration::from_secs(60),
        retry: retry_config(),
        tables: vec![table_config()],
    }
}

async fn setup_db() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}", dir.path().join("ops.db").display());
    let db = Database::connect(&dsn).await.unwrap();

    let Database::Sqlite(pool) = &db else {
        unreachable!()
    };
    sqlx::query(
        "CREATE TABLE conversation_events (
            id INTEGER PRIMARY KEY,
            received_at TEXT NOT NULL,
            payload TEXT
        )",
    )
    .execute(pool)
    .await
    .unwrap();

    (db, dir)
}

/// Insert `count` rows with consecutive ids starting at `first_id`, all
/// inside the given hour of [`day`].
async fn insert_hour_rows(db: &Database, first_id: i64, count: i64, hour: u32) {
    let Database::Sqlite(pool) = db else {
        unreachable!()
    };
    for i in 0..count {
        let id = first_id + i;
        let ts = format!("2024-01-01T{hour:02}:{:02}:{:02}+00:00", i % 60, (i / 60) % 60);
        sqlx::query("INSERT INTO conversation_events (id, received_at, payload) VALUES (?, ?, ?)")
            .bind(id)
            .bind(ts)
            .bind(format!("payload-{id}"))
            .execute(pool)
            .await
            .unwrap();
    }
}

async fn insert_recent_rows(db: &Database, first_id: i64, count: i64) {
    let Database::Sqlite(pool) = db else {
        unreachable!()
    };
    let ts = Utc::now().to_rfc3339();
    for i in 0..count {
        sqlx::query("INSERT INTO conversation_events (id, received_at, payload) VALUES (?, ?, ?)")
            .bind(first_id + i)
            .bind(&ts)
            .bind("recent")
            .execute(pool)
            .await
            .unwrap();
    }
}

async fn count_rows(db: &Database) -> i64 {
    db.count_by_id_range(TABLE, "id", i64::MIN + 1, i64::MAX)
        .await
        .unwrap()
}

fn uploader_for(store: Arc<dyn ObjectStore>) -> Arc<StorageUploader> {
    Arc::new(StorageUploader::new(store, RetryPolicy::from(&retry_config())))
}

#[tokio::test]
async fn test_full_run_archives_and_deletes() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 1, 500, 3).await;
    insert_recent_rows(&db, 1000, 5).await;

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let orchestrator = ArchiveOrchestrator::new(db.clone(), store.clone(), archiver_config());
    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.total_errors(), 0);
    let table = &summary.tables[0];
    assert_eq!(table.days_processed, 1);
    assert_eq!(table.hours_completed, 1);
    assert_eq!(table.records_archived, 500);
    assert_eq!(table.records_deleted, 500);

    // The verified object carries the count and id range as metadata
    let path = archive_object_path("test", TABLE, day(), 3);
    let info = uploader_for(store)
        .check_existing(&path)
        .await
        .unwrap()
        .expect("exported object should verify");
    assert_eq!(info.record_count, 500);
    assert_eq!(info.min_id, 1);
    assert_eq!(info.max_id, 500);

    // Archived rows are gone, recent rows untouched
    assert_eq!(count_rows(&db).await, 5);

    // Ledger says completed with the full deletion count
    let date_hour = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
    let job = db.get_job(TABLE, date_hour).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_archived, 500);
    assert_eq!(job.records_deleted, 500);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_empty_backlog_is_a_no_op() {
    let (db, _dir) = setup_db().await;
    insert_recent_rows(&db, 1, 10).await;

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let orchestrator = ArchiveOrchestrator::new(db.clone(), store.clone(), archiver_config());
    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.total_errors(), 0);
    assert_eq!(summary.tables[0].days_processed, 0);
    assert_eq!(count_rows(&db).await, 10);

    let objects: Vec<ObjectMeta> = store.list(None).try_collect().await.unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_purge_only_table_deletes_without_export() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 1, 50, 7).await;

    let mut config = archiver_config();
    config.tables[0].archive_to_parquet = false;

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let orchestrator = ArchiveOrchestrator::new(db.clone(), store.clone(), config);
    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.total_errors(), 0);
    assert_eq!(summary.tables[0].records_deleted, 50);
    assert_eq!(count_rows(&db).await, 0);

    let objects: Vec<ObjectMeta> = store.list(None).try_collect().await.unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_export_is_idempotent() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 10, 25, 5).await;

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let exporter = HourlyExporter::new(db.clone(), uploader_for(store), "test".to_string(), 100);

    let first = exporter.export_hour(&table_config(), day(), 5).await.unwrap();
    let ExportOutcome::Exported(summary) = &first else {
        panic!("first export should write a new object, got {first:?}");
    };
    assert_eq!(summary.record_count, 25);
    assert_eq!(summary.min_id, 10);
    assert_eq!(summary.max_id, 34);

    // The second call trusts the stored metadata instead of re-exporting
    let second = exporter.export_hour(&table_config(), day(), 5).await.unwrap();
    let ExportOutcome::Existing(reused) = &second else {
        panic!("second export should reuse the verified object, got {second:?}");
    };
    assert_eq!(reused, summary);
}

#[tokio::test]
async fn test_id_range_deletion_is_idempotent() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 1, 40, 2).await;

    let cleaner = TableCleaner::new(db.clone(), 10);
    let first = cleaner.delete_by_id_range(TABLE, "id", 1, 40, 40).await.unwrap();
    assert_eq!(first, 40);

    let second = cleaner.delete_by_id_range(TABLE, "id", 1, 40, 40).await.unwrap();
    assert_eq!(second, 0);
    assert_eq!(count_rows(&db).await, 0);
}

#[tokio::test]
async fn test_live_count_mismatch_is_nonfatal() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 1, 20, 4).await;

    // The verified export is authoritative: a disagreeing live count is
    // only a warning and the deletion still runs to completion
    let cleaner = TableCleaner::new(db.clone(), 10);
    let deleted = cleaner
        .delete_archived_records(&table_config(), 1, 20, 999, &HourWindow::of(day(), 4))
        .await
        .unwrap();
    assert_eq!(deleted, 20);
    assert_eq!(count_rows(&db).await, 0);
}

#[tokio::test]
async fn test_recovery_completes_interrupted_day() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 1, 500, 3).await;

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    // Simulate a crash after upload verification but before deletion:
    // the object and the exported job exist, the source rows do not move
    let exporter = HourlyExporter::new(
        db.clone(),
        uploader_for(store.clone()),
        "test".to_string(),
        100,
    );
    let outcome = exporter.export_hour(&table_config(), day(), 3).await.unwrap();
    let summary = outcome.summary().unwrap();
    let date_hour = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
    db.record_exported(TABLE, date_hour, summary).await.unwrap();
    assert_eq!(count_rows(&db).await, 500);

    let recovery = RecoveryService::new(db.clone(), store, archiver_config());
    let results = recovery.run().await.unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.promoted, "day should promote: {:?}", result.failures);
    assert_eq!(result.hours_verified, 24);
    assert_eq!(result.records_archived, 500);
    assert_eq!(result.records_deleted, 500);

    assert_eq!(count_rows(&db).await, 0);
    let job = db.get_job(TABLE, date_hour).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_deleted, 500);
}

#[tokio::test]
async fn test_recovery_names_the_failing_hour() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 1, 100, 3).await;

    let faulty = Arc::new(FaultyStore::new());
    let store: Arc<dyn ObjectStore> = faulty.clone();

    // Hour 03 exported and recorded before the interruption
    let exporter = HourlyExporter::new(
        db.clone(),
        uploader_for(store.clone()),
        "test".to_string(),
        100,
    );
    let outcome = exporter.export_hour(&table_config(), day(), 3).await.unwrap();
    let date_hour_03 = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
    db.record_exported(TABLE, date_hour_03, outcome.summary().unwrap())
        .await
        .unwrap();

    // Hour 13 still has live rows, and its upload will fail to promote
    insert_hour_rows(&db, 2000, 30, 13).await;
    faulty.fail_promotion.store(true, Ordering::SeqCst);

    let recovery = RecoveryService::new(db.clone(), store, archiver_config());
    let results = recovery.run().await.unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(!result.promoted);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].0, 13);

    // Hour 03 was reconciled and its rows deleted, but the day stays
    // non-terminal and its error message names the outstanding hour
    assert_eq!(count_rows(&db).await, 30);
    let job = db.get_job(TABLE, date_hour_03).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    let message = job.error_message.unwrap();
    assert!(message.contains("13"), "message should name hour 13: {message}");
}

#[tokio::test]
async fn test_recovery_accumulates_partial_deletions() {
    let (db, _dir) = setup_db().await;
    insert_hour_rows(&db, 1, 100, 3).await;

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    // Simulate a crash mid-deletion: the export verified, 40 of 100 rows
    // were deleted, and that partial total made it onto the job row
    let exporter = HourlyExporter::new(
        db.clone(),
        uploader_for(store.clone()),
        "test".to_string(),
        100,
    );
    let outcome = exporter.export_hour(&table_config(), day(), 3).await.unwrap();
    let date_hour = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
    db.record_exported(TABLE, date_hour, outcome.summary().unwrap())
        .await
        .unwrap();
    let cleaner = TableCleaner::new(db.clone(), 10);
    cleaner.delete_by_id_range(TABLE, "id", 1, 40, 40).await.unwrap();
    db.mark_error(TABLE, date_hour, 40, "deletion interrupted")
        .await
        .unwrap();
    assert_eq!(count_rows(&db).await, 60);

    let recovery = RecoveryService::new(db.clone(), store, archiver_config());
    let results = recovery.run().await.unwrap();

    // The prior partial deletion and this pass's remainder add up
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.promoted, "day should promote: {:?}", result.failures);
    assert_eq!(result.records_archived, 100);
    assert_eq!(result.records_deleted, 100);

    assert_eq!(count_rows(&db).await, 0);
    let job = db.get_job(TABLE, date_hour).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.records_deleted, 100);
}

#[tokio::test]
async fn test_failed_recovery_releases_lease() {
    let (db, _dir) = setup_db().await;

    // A ledger row whose status no longer parses makes the whole table
    // reconciliation fail
    let Database::Sqlite(pool) = &db else {
        unreachable!()
    };
    sqlx::query(
        "INSERT INTO archive_jobs (table_name, date_hour, status, started_at)
         VALUES (?, ?, 'archiving', ?)",
    )
    .bind(TABLE)
    .bind("2024-01-01T03:00:00+00:00")
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .unwrap();

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let recovery = RecoveryService::new(db.clone(), store, archiver_config());
    assert!(recovery.run().await.is_err());

    // The lease does not survive the failure
    let acquired = db
        .try_acquire_lease(TABLE, "other-runner", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(acquired, "lease should be free after a failed run");
}

#[tokio::test]
async fn test_upload_refuses_corrupted_metadata() {
    let faulty = Arc::new(FaultyStore::new());
    faulty.corrupt_readback.store(true, Ordering::SeqCst);
    let uploader = uploader_for(faulty.clone());

    let mut local = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut local, b"parquet bytes").unwrap();

    let metadata = UploadMetadata {
        table: TABLE.to_string(),
        record_count: 7,
        min_id: 1,
        max_id: 7,
    };
    let err = uploader
        .upload_with_verification(local.path(), "archives/test/x/2024-01-01/03.parquet", &metadata)
        .await
        .unwrap_err();
    assert!(
        format!("{err:#}").contains("record count mismatch"),
        "unexpected error: {err:#}"
    );

    // Neither the temp object nor the final object survives
    let objects: Vec<ObjectMeta> = faulty.inner.list(None).try_collect().await.unwrap();
    assert!(objects.is_empty(), "leftover objects: {objects:?}");
}

/// In-memory store with switchable faults: failing promotion copies and
/// corrupted metadata readback.
#[derive(Debug)]
struct FaultyStore {
    inner: InMemory,
    fail_promotion: AtomicBool,
    corrupt_readback: AtomicBool,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: InMemory::new(),
            fail_promotion: AtomicBool::new(false),
            corrupt_readback: AtomicBool::new(false),
        }
    }
}

impl fmt::Display for FaultyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FaultyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOptions,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        let mut result = self.inner.get_opts(location, options).await?;
        if self.corrupt_readback.load(Ordering::SeqCst) {
            result.attributes.insert(
                Attribute::Metadata("record_count".into()),
                "999999".to_string().into(),
            );
        }
        Ok(result)
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        if self.fail_promotion.load(Ordering::SeqCst) {
            return Err(object_store::Error::Generic {
                store: "FaultyStore",
                source: "promotion disabled".into(),
            });
        }
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
