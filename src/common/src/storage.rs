use anyhow::Result;
use chrono::NaiveDate;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use std::sync::Arc;
use url::Url;

/// Create a cold-storage object store from a DSN string.
///
/// Supported schemes:
/// - `file:///path/to/dir` — local filesystem (the directory must exist)
/// - `memory://` — in-memory store, used by tests
/// - `s3://bucket` — S3, credentials and region taken from the environment
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/storage"
                ));
            }
            // file://.data/archive parses with ".data" as host; rejoin it
            let path = match url.host_str() {
                Some(host) => format!("{host}{path}"),
                None => path.to_string(),
            };
            std::fs::create_dir_all(&path)?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let bucket = url
                .host_str()
                .ok_or_else(|| anyhow::anyhow!("S3 DSN must specify a bucket: s3://bucket"))?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok(Arc::new(store))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Cold-storage location of one exported hour.
///
/// The environment discriminator keeps test and production archives from
/// colliding in a shared bucket.
pub fn archive_object_path(environment: &str, table: &str, day: NaiveDate, hour: u32) -> String {
    format!(
        "archives/{}/{}/{}/{:02}.parquet",
        environment,
        table,
        day.format("%Y-%m-%d"),
        hour
    )
}
