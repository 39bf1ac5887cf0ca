//! Test harness for isolated pipeline runs.
//!
//! The `TestHarness` struct provides:
//! - Temporary directories for input files and filesystem object stores
//! - An in-memory database with a job store and change feed
//! - Factories for orchestrators and derivative uploaders wired to test doubles

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use tempfile::TempDir;
use tokio::sync::Notify;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use racepix::db::Database;
use racepix::derivatives::{
    DerivativeError, DerivativeOptions, DerivativeUploader, NoWatermark, Watermark,
};
use racepix::jobs::{JobChangeFeed, JobStore};
use racepix::orchestrator::BulkUploadOrchestrator;
use racepix::sanitize::ArchiveLimits;
use racepix::storage::{FsObjectStore, ObjectStore, SharedStore, StoredObject};
use racepix::transport::{ArchiveTransport, RetryPolicy, SingleShotTransport};
use racepix::trigger::{ProcessingNotifier, ProcessingTrigger, TriggerError, TriggerPolicy};
use racepix::StorageError;

/// Isolated environment: temp dirs plus an in-memory job database.
pub struct TestHarness {
    temp_dir: TempDir,
    /// Where test inputs (archives, photos) are written.
    pub input_dir: PathBuf,
    /// Root of every filesystem object store the harness creates.
    pub storage_root: PathBuf,
    pub database: Database,
    pub jobs: JobStore,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let input_dir = temp_dir.path().join("input");
        let storage_root = temp_dir.path().join("storage");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");
        std::fs::create_dir_all(&storage_root).expect("Failed to create storage dir");

        let database = Database::open_in_memory().expect("Failed to open database");
        let jobs = JobStore::new(database.clone(), JobChangeFeed::default());

        Self {
            temp_dir,
            input_dir,
            storage_root,
            database,
            jobs,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write_input(&self, filename: &str, content: &[u8]) -> PathBuf {
        let path = self.input_dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }

    /// Writes a ZIP archive with the given members, in order.
    pub fn write_zip(&self, filename: &str, members: &[(&str, &[u8])]) -> PathBuf {
        let path = self.input_dir.join(filename);
        let file = std::fs::File::create(&path).expect("Failed to create archive");
        let mut zip = ZipWriter::new(file);
        for (name, bytes) in members {
            zip.start_file(*name, SimpleFileOptions::default())
                .expect("Failed to start zip member");
            zip.write_all(bytes).expect("Failed to write zip member");
        }
        zip.finish().expect("Failed to finish archive");
        path
    }

    /// Writes a small gradient JPEG.
    pub fn write_photo(&self, filename: &str, width: u32, height: u32) -> PathBuf {
        let path = self.input_dir.join(filename);
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        DynamicImage::ImageRgb8(image)
            .save(&path)
            .expect("Failed to write photo");
        path
    }

    pub fn store(&self, bucket: &str) -> Arc<FsObjectStore> {
        Arc::new(
            FsObjectStore::new(&self.storage_root, bucket)
                .with_public_base_url("https://cdn.test"),
        )
    }

    pub fn single_shot(&self, store: SharedStore) -> Arc<dyn ArchiveTransport> {
        Arc::new(SingleShotTransport::new(store, RetryPolicy::immediate(3)))
    }

    /// Trigger with immediate retries so exhaustion tests stay fast.
    pub fn trigger(&self, notifier: Arc<dyn ProcessingNotifier>) -> ProcessingTrigger {
        ProcessingTrigger::new(
            notifier,
            self.jobs.clone(),
            TriggerPolicy {
                attempts: 3,
                base_delay: Duration::ZERO,
            },
        )
    }

    pub fn orchestrator(
        &self,
        transport: Arc<dyn ArchiveTransport>,
        notifier: Arc<dyn ProcessingNotifier>,
    ) -> BulkUploadOrchestrator {
        BulkUploadOrchestrator::new(
            self.jobs.clone(),
            transport,
            self.trigger(notifier),
            ArchiveLimits::default(),
        )
    }

    pub fn uploader(
        &self,
        originals: SharedStore,
        public: SharedStore,
        watermark: Option<Arc<dyn Watermark>>,
    ) -> DerivativeUploader {
        DerivativeUploader::new(
            originals,
            public,
            watermark.unwrap_or_else(|| Arc::new(NoWatermark)),
            DerivativeOptions {
                thumbnail_edge: 32,
                jpeg_quality: 80,
            },
        )
    }
}

/// Every object in a store.
pub async fn objects(store: &dyn ObjectStore) -> Vec<String> {
    store.list("").await.expect("Failed to list store")
}

/// Worker stand-in that records every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.failing.store(true, Ordering::SeqCst);
        notifier
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("notifier lock").clone()
    }
}

#[async_trait]
impl ProcessingNotifier for RecordingNotifier {
    async fn notify(&self, job_id: &str) -> Result<(), TriggerError> {
        self.calls
            .lock()
            .expect("notifier lock")
            .push(job_id.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(TriggerError::Status {
                status: 503,
                body: "worker unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Filesystem store that can hold writes open and fail chosen paths.
pub struct FaultyStore {
    inner: FsObjectStore,
    /// Signalled once a put has written its object.
    pub entered: Notify,
    /// When set, puts wait for this after writing.
    hold: Option<Notify>,
    fail_containing: Mutex<Vec<String>>,
    deletes: AtomicUsize,
}

impl FaultyStore {
    pub fn new(harness: &TestHarness, bucket: &str) -> Self {
        Self {
            inner: FsObjectStore::new(&harness.storage_root, bucket),
            entered: Notify::new(),
            hold: None,
            fail_containing: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Puts never finish on their own; only a cancel ends them.
    pub fn holding(mut self) -> Self {
        self.hold = Some(Notify::new());
        self
    }

    pub fn fail_paths_containing(&self, needle: &str) {
        self.fail_containing
            .lock()
            .expect("fault lock")
            .push(needle.to_string());
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let fail = self
            .fail_containing
            .lock()
            .expect("fault lock")
            .iter()
            .any(|needle| path.contains(needle.as_str()));
        if fail {
            return Err(StorageError::Status {
                status: 500,
                body: "injected failure".to_string(),
            });
        }
        let stored = self.inner.put(path, bytes, content_type).await?;
        self.entered.notify_one();
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        Ok(stored)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    fn public_url(&self, path: &str) -> String {
        self.inner.public_url(path)
    }
}

/// Fails the `fail_on`-th photo (1-based) it is asked to mark.
pub struct FailingWatermark {
    fail_on: usize,
    calls: AtomicUsize,
}

impl FailingWatermark {
    pub fn on_call(fail_on: usize) -> Self {
        Self {
            fail_on,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Watermark for FailingWatermark {
    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, DerivativeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(DerivativeError::Watermark(format!(
                "mark rejected on photo {}",
                call
            )));
        }
        Ok(image)
    }
}
