//! Sequential batch upload of many photos.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;

use super::{DerivativeError, DerivativeUploader, PhotoUpload};
use crate::sanitize::redact_path;

/// Default interval between proactive credential refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Reported before each photo starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// 1-based position of the photo being uploaded.
    pub current: usize,
    pub total: usize,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub file_name: String,
    pub error: String,
}

/// Partition of a batch into uploaded and failed photos, in input order.
#[derive(Debug, Default, Serialize)]
pub struct BatchResult {
    pub successful: Vec<PhotoUpload>,
    pub failed: Vec<BatchFailure>,
}

/// Uploads `files` one at a time.
///
/// Credentials are refreshed before the first photo and again whenever
/// `refresh_interval` has passed. A photo that fails with an auth-shaped error
/// gets one more attempt right after a forced refresh. A failing photo never
/// stops the batch.
pub async fn upload_batch<F>(
    uploader: &DerivativeUploader,
    event_id: &str,
    files: &[PathBuf],
    refresh_interval: Duration,
    mut on_progress: F,
) -> BatchResult
where
    F: FnMut(BatchProgress),
{
    let span = tracing::info_span!("derivatives.batch", event_id = %event_id, total = files.len());
    run_batch(uploader, event_id, files, refresh_interval, &mut on_progress)
        .instrument(span)
        .await
}

async fn run_batch<F>(
    uploader: &DerivativeUploader,
    event_id: &str,
    files: &[PathBuf],
    refresh_interval: Duration,
    on_progress: &mut F,
) -> BatchResult
where
    F: FnMut(BatchProgress),
{
    let total = files.len();
    let mut result = BatchResult::default();
    let mut last_refresh: Option<Instant> = None;

    for (index, file) in files.iter().enumerate() {
        let file_name = redact_path(file);
        on_progress(BatchProgress {
            current: index + 1,
            total,
            file_name: file_name.clone(),
        });

        let due = match last_refresh {
            None => true,
            Some(at) => at.elapsed() >= refresh_interval,
        };
        if due {
            refresh(uploader).await;
            last_refresh = Some(Instant::now());
        }

        let mut outcome = uploader.upload_photo(event_id, file).await;
        if matches!(&outcome, Err(e) if e.is_auth_error()) {
            tracing::info!(file = %file_name, "Credential rejected, refreshing and retrying once");
            refresh(uploader).await;
            last_refresh = Some(Instant::now());
            outcome = uploader.upload_photo(event_id, file).await;
        }

        match outcome {
            Ok(photo) => result.successful.push(photo),
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Photo failed");
                result.failed.push(failure(file_name, &e));
            }
        }
    }

    tracing::info!(
        successful = result.successful.len(),
        failed = result.failed.len(),
        "Batch finished"
    );
    result
}

async fn refresh(uploader: &DerivativeUploader) {
    if let Err(e) = uploader.refresh_credentials().await {
        tracing::warn!(error = %e, "Credential refresh failed, continuing with the current one");
    }
}

fn failure(file_name: String, error: &DerivativeError) -> BatchFailure {
    BatchFailure {
        file_name,
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::write_jpeg;
    use super::*;
    use crate::derivatives::{DerivativeOptions, NoWatermark};
    use crate::error::StorageError;
    use crate::storage::{FsObjectStore, ObjectStore, StoredObject};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Rejects every put with 401 until credentials are refreshed `needed` times.
    struct ExpiringStore {
        inner: FsObjectStore,
        refreshes: AtomicUsize,
        needed: usize,
    }

    #[async_trait::async_trait]
    impl ObjectStore for ExpiringStore {
        fn bucket(&self) -> &str {
            self.inner.bucket()
        }

        async fn put(
            &self,
            path: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<StoredObject, StorageError> {
            if self.refreshes.load(Ordering::SeqCst) < self.needed {
                return Err(StorageError::Status {
                    status: 401,
                    body: "jwt expired".into(),
                });
            }
            self.inner.put(path, bytes, content_type).await
        }

        async fn delete(&self, path: &str) -> Result<(), StorageError> {
            self.inner.delete(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }

        fn public_url(&self, path: &str) -> String {
            self.inner.public_url(path)
        }

        async fn refresh_credentials(&self) -> Result<(), StorageError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn uploader(dir: &std::path::Path, originals: Arc<dyn ObjectStore>) -> DerivativeUploader {
        DerivativeUploader::new(
            originals,
            Arc::new(FsObjectStore::new(dir.join("s"), "public")),
            Arc::new(NoWatermark),
            DerivativeOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_progress_and_partition() {
        let dir = TempDir::new().unwrap();
        let good = write_jpeg(dir.path(), "a.jpg", 16, 16);
        let bad = dir.path().join("b.jpg");
        std::fs::write(&bad, b"garbage").unwrap();
        let also_good = write_jpeg(dir.path(), "c.jpg", 16, 16);

        let uploader = uploader(
            dir.path(),
            Arc::new(FsObjectStore::new(dir.path().join("s"), "originals")),
        );
        let mut seen = Vec::new();
        let result = upload_batch(
            &uploader,
            "evt-1",
            &[good, bad, also_good],
            DEFAULT_REFRESH_INTERVAL,
            |p| seen.push((p.current, p.total, p.file_name)),
        )
        .await;

        assert_eq!(
            seen,
            vec![
                (1, 3, "a.jpg".to_string()),
                (2, 3, "b.jpg".to_string()),
                (3, 3, "c.jpg".to_string())
            ]
        );
        assert_eq!(result.successful.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].file_name, "b.jpg");
    }

    #[tokio::test]
    async fn test_auth_failure_is_retried_after_refresh() {
        let dir = TempDir::new().unwrap();
        let photo = write_jpeg(dir.path(), "a.jpg", 16, 16);
        // The initial refresh is not enough; the forced one is.
        let store = Arc::new(ExpiringStore {
            inner: FsObjectStore::new(dir.path().join("s"), "originals"),
            refreshes: AtomicUsize::new(0),
            needed: 2,
        });
        let uploader = uploader(dir.path(), store.clone());

        let result = upload_batch(&uploader, "evt-1", &[photo], DEFAULT_REFRESH_INTERVAL, |_| {}).await;

        assert_eq!(result.successful.len(), 1);
        assert!(result.failed.is_empty());
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_retried_only_once() {
        let dir = TempDir::new().unwrap();
        let photo = write_jpeg(dir.path(), "a.jpg", 16, 16);
        let store = Arc::new(ExpiringStore {
            inner: FsObjectStore::new(dir.path().join("s"), "originals"),
            refreshes: AtomicUsize::new(0),
            needed: usize::MAX,
        });
        let uploader = uploader(dir.path(), store.clone());

        let result = upload_batch(&uploader, "evt-1", &[photo], DEFAULT_REFRESH_INTERVAL, |_| {}).await;

        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].error.contains("401"));
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refreshes_when_interval_elapses() {
        let dir = TempDir::new().unwrap();
        let first = write_jpeg(dir.path(), "a.jpg", 8, 8);
        let second = write_jpeg(dir.path(), "b.jpg", 8, 8);
        let store = Arc::new(ExpiringStore {
            inner: FsObjectStore::new(dir.path().join("s"), "originals"),
            refreshes: AtomicUsize::new(0),
            needed: 0,
        });
        let uploader = uploader(dir.path(), store.clone());

        // A zero interval refreshes before every photo.
        upload_batch(&uploader, "evt-1", &[first, second], Duration::ZERO, |_| {}).await;
        assert_eq!(store.refreshes.load(Ordering::SeqCst), 2);
    }
}
