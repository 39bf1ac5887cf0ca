//! Bulk upload orchestration.
//!
//! The orchestrator owns the lifecycle of an archive upload: validation, job
//! creation, the transport task, the hand-off to the worker, cancellation and
//! retry. In-flight uploads are tracked in [`ActiveUploads`] so a cancel can
//! reach the transport of the right job.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::Result;
use crate::jobs::{
    JobStatus, JobStore, JobWatch, NewJob, Subscription, TransitionOutcome, UploadJob,
};
use crate::sanitize::{validate_archive_file, ArchiveLimits};
use crate::storage::validate_object_path;
use crate::transport::{
    progress_channel, ArchiveTransport, ProgressReceiver, ProgressSender, UploadRequest,
};
use crate::trigger::{ProcessingTrigger, TriggerOutcome};

const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Where an archive of a job lives inside the archive bucket.
pub fn archive_object_path(event_id: &str, job_id: &str, archive_name: &str) -> String {
    format!("{}/{}-{}", event_id, job_id, archive_name)
}

struct ActiveUpload {
    cancel: CancellationToken,
    object_path: String,
}

/// Cancellation tokens of in-flight transports, keyed by job id.
#[derive(Default)]
pub struct ActiveUploads {
    inner: Mutex<HashMap<String, ActiveUpload>>,
}

impl ActiveUploads {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveUpload>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Active upload table was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn register(&self, job_id: &str, cancel: CancellationToken, object_path: &str) {
        self.lock().insert(
            job_id.to_string(),
            ActiveUpload {
                cancel,
                object_path: object_path.to_string(),
            },
        );
    }

    fn remove(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    /// Fires the token of `job_id`, if its transport is still running.
    fn cancel(&self, job_id: &str) -> Option<String> {
        self.lock().get(job_id).map(|active| {
            active.cancel.cancel();
            active.object_path.clone()
        })
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an upload task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// The archive is stored and the job reached `extracting`. `trigger` is
    /// `None` when the trigger itself could not run.
    Uploaded {
        job: UploadJob,
        trigger: Option<TriggerOutcome>,
    },
    /// The job was cancelled; its archive has been discarded.
    Cancelled { job_id: String },
    /// The transport gave up; the job is `failed`.
    Failed { job_id: String, error: String },
}

/// Handle to an upload running in the background.
pub struct ArchiveUpload {
    job: UploadJob,
    progress: ProgressReceiver,
    handle: JoinHandle<UploadOutcome>,
}

impl ArchiveUpload {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// The job as created, in `uploading`.
    pub fn job(&self) -> &UploadJob {
        &self.job
    }

    /// Latest transfer progress; `changed().await` waits for the next one.
    pub fn progress(&self) -> ProgressReceiver {
        self.progress.clone()
    }

    pub async fn wait(self) -> UploadOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job_id = %self.job.id, error = %e, "Upload task aborted");
                UploadOutcome::Failed {
                    job_id: self.job.id,
                    error: format!("upload task aborted: {}", e),
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct BulkUploadOrchestrator {
    store: JobStore,
    transport: Arc<dyn ArchiveTransport>,
    trigger: ProcessingTrigger,
    limits: ArchiveLimits,
    active: Arc<ActiveUploads>,
}

impl BulkUploadOrchestrator {
    pub fn new(
        store: JobStore,
        transport: Arc<dyn ArchiveTransport>,
        trigger: ProcessingTrigger,
        limits: ArchiveLimits,
    ) -> Self {
        Self {
            store,
            transport,
            trigger,
            limits,
            active: Arc::new(ActiveUploads::default()),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn active_uploads(&self) -> &ActiveUploads {
        &self.active
    }

    /// Validates `archive`, creates its job and starts the transfer.
    ///
    /// Returns as soon as the job exists. Nothing is created when validation
    /// fails.
    pub fn upload_archive(
        &self,
        archive: &Path,
        event_id: &str,
        user_id: &str,
    ) -> Result<ArchiveUpload> {
        validate_object_path(event_id)?;
        let file = validate_archive_file(archive, &self.limits)?;

        let job = self.store.create(&NewJob {
            event_id: event_id.to_string(),
            user_id: user_id.to_string(),
            archive_name: file.name.clone(),
            archive_size_bytes: file.size_bytes,
        })?;

        let request = UploadRequest {
            job_id: job.id.clone(),
            local_path: file.path,
            object_path: archive_object_path(event_id, &job.id, &file.name),
            size_bytes: file.size_bytes,
            content_type: ARCHIVE_CONTENT_TYPE.to_string(),
        };

        let cancel = CancellationToken::new();
        self.active
            .register(&job.id, cancel.clone(), &request.object_path);

        let (progress_tx, progress_rx) = progress_channel();
        let span = tracing::info_span!(
            "orchestrator.upload",
            job_id = %job.id,
            event_id = %event_id,
            archive = %file.name,
            transport = self.transport.name()
        );
        let this = self.clone();
        let handle = tokio::spawn(
            async move { this.run_upload(request, progress_tx, cancel).await }.instrument(span),
        );

        Ok(ArchiveUpload {
            job,
            progress: progress_rx,
            handle,
        })
    }

    async fn run_upload(
        &self,
        request: UploadRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> UploadOutcome {
        let job_id = request.job_id.clone();
        tracing::info!(bytes = request.size_bytes, "Archive upload started");
        let result = self.transport.upload(&request, &progress, &cancel).await;
        self.active.remove(&job_id);

        match result {
            Ok(storage_ref) => self.finish_upload(&request, &storage_ref).await,
            Err(e) if e.is_cancelled() => {
                self.discard(&request.object_path).await;
                tracing::info!("Archive upload cancelled");
                UploadOutcome::Cancelled { job_id }
            }
            Err(e) => {
                let message = format!("Archive upload failed: {}", e);
                match self.store.fail(&job_id, &message) {
                    Ok(TransitionOutcome::Unchanged(job)) if job.status == JobStatus::Cancelled => {
                        self.discard(&request.object_path).await;
                        UploadOutcome::Cancelled { job_id }
                    }
                    Ok(_) => {
                        tracing::error!(error = %e, "Archive upload failed");
                        UploadOutcome::Failed {
                            job_id,
                            error: message,
                        }
                    }
                    Err(store_err) => {
                        tracing::error!(error = %store_err, "Could not record upload failure");
                        UploadOutcome::Failed {
                            job_id,
                            error: message,
                        }
                    }
                }
            }
        }
    }

    /// Advances an uploaded job to `extracting` unless a cancel got there
    /// first, then hands it to the worker.
    async fn finish_upload(&self, request: &UploadRequest, storage_ref: &str) -> UploadOutcome {
        let job_id = request.job_id.clone();
        match self.store.mark_extracting(&job_id, storage_ref) {
            Ok(TransitionOutcome::Applied(job)) => {
                tracing::info!(archive_ref = %storage_ref, "Archive stored, job extracting");
                let trigger = match self.trigger.trigger(&job_id).await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        tracing::error!(error = %e, "Processing trigger failed to run");
                        None
                    }
                };
                let job = self.store.get(&job_id).ok().flatten().unwrap_or(job);
                UploadOutcome::Uploaded { job, trigger }
            }
            Ok(TransitionOutcome::Unchanged(job)) if job.status == JobStatus::Cancelled => {
                tracing::info!("Job was cancelled while the upload finished, discarding archive");
                self.discard(&request.object_path).await;
                UploadOutcome::Cancelled { job_id }
            }
            Ok(TransitionOutcome::Unchanged(job)) => UploadOutcome::Failed {
                job_id,
                error: format!("job is {} and cannot take the uploaded archive", job.status),
            },
            Err(e) => {
                tracing::error!(error = %e, "Could not record uploaded archive");
                UploadOutcome::Failed {
                    job_id,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn discard(&self, object_path: &str) {
        if let Err(e) = self.transport.discard(object_path).await {
            tracing::warn!(object = %object_path, error = %e, "Failed to delete partial archive");
        }
    }

    /// Cancels a `pending`/`uploading` job.
    ///
    /// `Ok(false)` means the job was already terminal. Jobs the worker owns
    /// are refused with `NotCancellable`.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let outcome = self.store.cancel(job_id)?;
        let job = match outcome {
            TransitionOutcome::Applied(job) => job,
            TransitionOutcome::Unchanged(_) => return Ok(false),
        };

        let object_path = match self.active.cancel(job_id) {
            Some(path) => path,
            None => archive_object_path(&job.event_id, &job.id, &job.archive_name),
        };
        self.discard(&object_path).await;
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(true)
    }

    /// Re-queues a `failed` job whose archive is still stored.
    ///
    /// `Ok(false)` when the job is not failed or never got its archive.
    pub async fn retry_job(&self, job_id: &str) -> Result<bool> {
        if !self.store.retry(job_id)?.was_applied() {
            return Ok(false);
        }
        tracing::info!(job_id = %job_id, "Job re-queued for extraction");
        // The job is back in `extracting` whatever the trigger reports.
        match self.trigger.trigger(job_id).await {
            Ok(outcome) => tracing::debug!(job_id = %job_id, ?outcome, "Retry trigger finished"),
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Processing trigger failed to run"),
        }
        Ok(true)
    }

    pub fn job_status(&self, job_id: &str) -> Result<Option<UploadJob>> {
        Ok(self.store.get(job_id)?)
    }

    /// Calls `callback` with every update of `job_id` until the returned
    /// subscription is dropped.
    pub fn subscribe<F>(&self, job_id: &str, callback: F) -> Subscription
    where
        F: FnMut(UploadJob) + Send + 'static,
    {
        self.store.feed().subscribe_with(job_id, callback)
    }

    pub fn watch(&self, job_id: &str) -> JobWatch {
        self.store.feed().watch(job_id)
    }
}
