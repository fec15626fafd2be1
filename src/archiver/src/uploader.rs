//! Cold-storage upload with independent verification.
//!
//! The upload protocol never lets an unverified object reach its final
//! path:
//!
//! 1. upload to `<path>.tmp` with the record count and id range embedded
//!    as the object's own metadata
//! 2. re-read that metadata from storage and compare the record count —
//!    a mismatch deletes the temp object and fails the hour
//! 3. promote temp → final via copy-then-delete; a crash in between
//!    leaves a harmless orphaned temp object
//! 4. re-verify the final object exists and return its size
//!
//! Every network call goes through the shared retry policy.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::path::Path;
use object_store::{Attribute, Attributes, GetOptions, ObjectStore, PutOptions};
use tracing::{info, warn};

use crate::retry::RetryPolicy;

const META_RECORD_COUNT: &str = "record_count";
const META_MIN_ID: &str = "min_id";
const META_MAX_ID: &str = "max_id";
const META_TABLE: &str = "table";

/// Summary embedded in the uploaded object's metadata.
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub table: String,
    pub record_count: i64,
    pub min_id: i64,
    pub max_id: i64,
}

/// Metadata read back from an existing cold-storage object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredFileInfo {
    pub record_count: i64,
    pub min_id: i64,
    pub max_id: i64,
    pub file_size: u64,
}

pub struct StorageUploader {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl StorageUploader {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Read back an object's embedded metadata, or `None` if the object
    /// does not exist.
    async fn read_metadata(&self, path: &str) -> Result<Option<StoredFileInfo>> {
        let location = Path::from(path);
        let options = GetOptions {
            head: true,
            ..Default::default()
        };

        let result = self
            .retry
            .run("read object metadata", || {
                let store = self.store.clone();
                let location = location.clone();
                let options = options.clone();
                async move {
                    match store.get_opts(&location, options).await {
                        Ok(r) => Ok(Some(r)),
                        Err(object_store::Error::NotFound { .. }) => Ok(None),
                        Err(e) => Err(e.into()),
                    }
                }
            })
            .await?;

        let Some(result) = result else {
            return Ok(None);
        };

        let get_i64 = |key: &'static str| -> Option<i64> {
            result
                .attributes
                .get(&Attribute::Metadata(key.into()))
                .and_then(|v| v.parse::<i64>().ok())
        };

        Ok(Some(StoredFileInfo {
            record_count: get_i64(META_RECORD_COUNT).unwrap_or(0),
            min_id: get_i64(META_MIN_ID).unwrap_or(0),
            max_id: get_i64(META_MAX_ID).unwrap_or(0),
            file_size: result.meta.size,
        }))
    }

    /// A previously verified export for this path, if one exists. The
    /// stored metadata is authoritative; an object without a positive
    /// record count and id range does not qualify.
    pub async fn check_existing(&self, path: &str) -> Result<Option<StoredFileInfo>> {
        match self.read_metadata(path).await? {
            Some(info) if info.record_count > 0 && info.min_id > 0 && info.max_id > 0 => {
                Ok(Some(info))
            }
            _ => Ok(None),
        }
    }

    /// Delete an object whose metadata failed the [`check_existing`]
    /// validation, clearing the way for a fresh export.
    pub async fn delete_if_invalid(&self, path: &str) -> Result<()> {
        let location = Path::from(path);
        match self.store.head(&location).await {
            Ok(_) => {
                warn!(path = %path, "Deleting cold-storage object with invalid metadata");
                if let Err(e) = self.store.delete(&location).await {
                    warn!(path = %path, error = %e, "Failed to delete invalid object");
                }
                Ok(())
            }
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Upload a local file to `dest` with verification and atomic
    /// promotion. Returns the final object's size in bytes.
    pub async fn upload_with_verification(
        &self,
        local: &std::path::Path,
        dest: &str,
        metadata: &UploadMetadata,
    ) -> Result<u64> {
        let tmp_path = format!("{dest}.tmp");
        let tmp = Path::from(tmp_path.as_str());
        let fin = Path::from(dest);

        let body = Bytes::from(
            tokio::fs::read(local)
                .await
                .with_context(|| format!("failed to read local export {}", local.display()))?,
        );

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::Metadata(META_TABLE.into()), metadata.table.clone().into());
        attributes.insert(
            Attribute::Metadata(META_RECORD_COUNT.into()),
            metadata.record_count.to_string().into(),
        );
        attributes.insert(
            Attribute::Metadata(META_MIN_ID.into()),
            metadata.min_id.to_string().into(),
        );
        attributes.insert(
            Attribute::Metadata(META_MAX_ID.into()),
            metadata.max_id.to_string().into(),
        );
        let put_options = PutOptions {
            attributes,
            ..Default::default()
        };

        self.retry
            .run("upload temp object", || {
                let store = self.store.clone();
                let tmp = tmp.clone();
                let body = body.clone();
                let options = put_options.clone();
                async move {
                    store.put_opts(&tmp, body.into(), options).await?;
                    Ok(())
                }
            })
            .await
            .with_context(|| format!("upload of {tmp_path} failed"))?;

        // Independent verification: trust only what storage reports back,
        // not what the upload call claimed.
        let written = self
            .read_metadata(&tmp_path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("upload verification failed: {tmp_path} not found"))?;

        if written.record_count != metadata.record_count {
            if let Err(e) = self.store.delete(&tmp).await {
                warn!(path = %tmp_path, error = %e, "Failed to delete mismatched temp object");
            }
            anyhow::bail!(
                "record count mismatch for {dest}: wrote {} but object metadata shows {}",
                metadata.record_count,
                written.record_count
            );
        }

        // Promote via copy-then-delete. A crash between the two leaves an
        // orphaned temp object, which the next run overwrites or ignores.
        self.retry
            .run("promote temp object", || {
                let store = self.store.clone();
                let tmp = tmp.clone();
                let fin = fin.clone();
                async move {
                    store.copy(&tmp, &fin).await?;
                    store.delete(&tmp).await?;
                    Ok(())
                }
            })
            .await
            .with_context(|| format!("promotion of {tmp_path} failed"))?;

        let final_meta = self
            .retry
            .run("verify final object", || {
                let store = self.store.clone();
                let fin = fin.clone();
                async move { Ok(store.head(&fin).await?) }
            })
            .await
            .with_context(|| format!("final object {dest} missing after promotion"))?;

        info!(
            path = %dest,
            record_count = metadata.record_count,
            size_bytes = final_meta.size,
            "Cold-storage upload verified"
        );

        Ok(final_meta.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::io::Write;
    use std::time::Duration;

    fn uploader() -> StorageUploader {
        let retry = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        StorageUploader::new(Arc::new(InMemory::new()), retry)
    }

    fn local_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    fn meta(count: i64) -> UploadMetadata {
        UploadMetadata {
            table: "events".to_string(),
            record_count: count,
            min_id: 10,
            max_id: 99,
        }
    }

    #[tokio::test]
    async fn test_upload_promotes_and_reports_size() {
        let up = uploader();
        let file = local_file(b"parquet bytes");

        let size = up
            .upload_with_verification(file.path(), "archives/dev/events/2024-01-01/03.parquet", &meta(7))
            .await
            .unwrap();
        assert_eq!(size, 13);

        // temp object is gone, final object is readable with its metadata
        let store = up.store();
        assert!(matches!(
            store
                .head(&Path::from("archives/dev/events/2024-01-01/03.parquet.tmp"))
                .await,
            Err(object_store::Error::NotFound { .. })
        ));
        let info = up
            .check_existing("archives/dev/events/2024-01-01/03.parquet")
            .await
            .unwrap()
            .expect("final object should verify");
        assert_eq!(info.record_count, 7);
        assert_eq!(info.min_id, 10);
        assert_eq!(info.max_id, 99);
    }

    #[tokio::test]
    async fn test_check_existing_absent_object() {
        let up = uploader();
        assert!(up.check_existing("nothing/here.parquet").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_if_invalid_removes_unverified_object() {
        let up = uploader();
        let store = up.store();
        store
            .put(&Path::from("bad.parquet"), Bytes::from_static(b"junk").into())
            .await
            .unwrap();

        // No embedded metadata, so it does not verify
        assert!(up.check_existing("bad.parquet").await.unwrap().is_none());
        up.delete_if_invalid("bad.parquet").await.unwrap();
        assert!(matches!(
            store.head(&Path::from("bad.parquet")).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }
}
