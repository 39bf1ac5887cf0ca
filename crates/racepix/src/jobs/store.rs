//! Job store with persistent database storage.
//!
//! The store is the only writer of `status`. Every check-and-write runs in one
//! SQLite transaction, and committed changes are published on the feed.

use uuid::Uuid;

use super::error::JobError;
use super::feed::JobChangeFeed;
use super::model::{self, ItemError, JobStatus, UploadJob};
use crate::db::job_repo;
use crate::db::Database;

/// Result of a transition request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The write happened; carries the new record.
    Applied(UploadJob),
    /// The record was terminal or already at the target; carries it untouched.
    Unchanged(UploadJob),
}

impl TransitionOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn job(&self) -> &UploadJob {
        match self {
            TransitionOutcome::Applied(job) | TransitionOutcome::Unchanged(job) => job,
        }
    }

    pub fn into_job(self) -> UploadJob {
        match self {
            TransitionOutcome::Applied(job) | TransitionOutcome::Unchanged(job) => job,
        }
    }
}

/// Identity and metadata of a job about to be created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub event_id: String,
    pub user_id: String,
    pub archive_name: String,
    pub archive_size_bytes: u64,
}

/// Persistent job store backed by rusqlite.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    feed: JobChangeFeed,
}

impl JobStore {
    pub fn new(db: Database, feed: JobChangeFeed) -> Self {
        Self { db, feed }
    }

    pub fn feed(&self) -> &JobChangeFeed {
        &self.feed
    }

    /// Creates a job directly in `uploading`.
    pub fn create(&self, new_job: &NewJob) -> Result<UploadJob, JobError> {
        let now = model::now();
        let job = UploadJob {
            id: Uuid::new_v4().to_string(),
            event_id: new_job.event_id.clone(),
            user_id: new_job.user_id.clone(),
            status: JobStatus::Uploading,
            archive_ref: None,
            archive_name: new_job.archive_name.clone(),
            archive_size_bytes: new_job.archive_size_bytes,
            total_items: None,
            processed_items: 0,
            failed_items: 0,
            item_errors: Vec::new(),
            file_manifest: None,
            error_message: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        job_repo::insert(&self.db, &job.to_row())?;
        log::info!(
            "Created upload job {} for event {} ({})",
            job.id,
            job.event_id,
            job.archive_name
        );
        self.feed.publish(job.clone());
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<UploadJob>, JobError> {
        match job_repo::find_by_id(&self.db, job_id)? {
            Some(row) => Ok(Some(UploadJob::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Jobs of one event, newest first.
    pub fn list_for_event(&self, event_id: &str, limit: u64) -> Result<Vec<UploadJob>, JobError> {
        job_repo::list_by_event(&self.db, event_id, limit)?
            .iter()
            .map(|row| UploadJob::from_row(row).map_err(JobError::from))
            .collect()
    }

    /// Records the archive location and moves `uploading -> extracting`.
    pub fn mark_extracting(
        &self,
        job_id: &str,
        archive_ref: &str,
    ) -> Result<TransitionOutcome, JobError> {
        self.transition(job_id, JobStatus::Extracting, |job| {
            job.archive_ref = Some(archive_ref.to_string());
        })
    }

    /// Moves a `pending`/`uploading` job to `cancelled`.
    ///
    /// Terminal jobs come back [`TransitionOutcome::Unchanged`]; jobs the
    /// worker already owns are refused with [`JobError::NotCancellable`].
    pub fn cancel(&self, job_id: &str) -> Result<TransitionOutcome, JobError> {
        self.transition(job_id, JobStatus::Cancelled, |_| {})
    }

    pub fn fail(&self, job_id: &str, message: &str) -> Result<TransitionOutcome, JobError> {
        self.transition(job_id, JobStatus::Failed, |job| {
            job.error_message = Some(message.to_string());
        })
    }

    /// Marks `failed` only while the job still sits in one of `allowed`.
    ///
    /// Used when the caller's knowledge might be stale: anything outside
    /// `allowed` is returned untouched.
    pub fn fail_if_in(
        &self,
        job_id: &str,
        allowed: &[JobStatus],
        message: &str,
    ) -> Result<TransitionOutcome, JobError> {
        self.db
            .with_transaction::<_, _, JobError>(|conn| {
                let mut job = load(conn, job_id)?;
                if !allowed.contains(&job.status)
                    || !job.status.can_transition_to(JobStatus::Failed)
                {
                    return Ok(TransitionOutcome::Unchanged(job));
                }
                apply_status(&mut job, JobStatus::Failed);
                job.error_message = Some(message.to_string());
                job_repo::update_in(conn, &job.to_row())?;
                Ok(TransitionOutcome::Applied(job))
            })
            .map(|outcome| self.published(outcome))
    }

    /// Moves a `failed` job that still has its archive back to `extracting`.
    ///
    /// Anything else is returned untouched.
    pub fn retry(&self, job_id: &str) -> Result<TransitionOutcome, JobError> {
        self.db
            .with_transaction::<_, _, JobError>(|conn| {
                let mut job = load(conn, job_id)?;
                if job.status != JobStatus::Failed || job.archive_ref.is_none() {
                    return Ok(TransitionOutcome::Unchanged(job));
                }
                job.status = JobStatus::Extracting;
                job.error_message = None;
                job.completed_at = None;
                job.updated_at = model::now();
                job_repo::update_in(conn, &job.to_row())?;
                Ok(TransitionOutcome::Applied(job))
            })
            .map(|outcome| self.published(outcome))
    }

    /// Worker picked the job up: `extracting -> processing` with the item count.
    pub fn start_processing(
        &self,
        job_id: &str,
        total_items: u64,
        manifest: Option<Vec<String>>,
    ) -> Result<TransitionOutcome, JobError> {
        self.transition(job_id, JobStatus::Processing, |job| {
            job.total_items = Some(total_items);
            job.processed_items = 0;
            job.failed_items = 0;
            job.file_manifest = manifest;
        })
    }

    pub fn record_item_success(
        &self,
        job_id: &str,
        item_name: &str,
    ) -> Result<TransitionOutcome, JobError> {
        self.record_item(job_id, item_name, None)
    }

    pub fn record_item_failure(
        &self,
        job_id: &str,
        item_name: &str,
        error: &str,
    ) -> Result<TransitionOutcome, JobError> {
        self.record_item(job_id, item_name, Some(error))
    }

    pub fn complete(&self, job_id: &str) -> Result<TransitionOutcome, JobError> {
        self.transition(job_id, JobStatus::Completed, |_| {})
    }

    fn record_item(
        &self,
        job_id: &str,
        item_name: &str,
        error: Option<&str>,
    ) -> Result<TransitionOutcome, JobError> {
        self.db
            .with_transaction::<_, _, JobError>(|conn| {
                let mut job = load(conn, job_id)?;
                if job.status.is_terminal() {
                    return Ok(TransitionOutcome::Unchanged(job));
                }
                if job.status != JobStatus::Processing {
                    return Err(JobError::NotProcessing {
                        job_id: job.id,
                        status: job.status,
                    });
                }

                let attempted = job.items_done() + 1;
                let total = job.total_items.unwrap_or(0);
                if attempted > total {
                    return Err(JobError::CounterOverflow {
                        job_id: job.id,
                        total,
                        attempted,
                    });
                }

                match error {
                    Some(message) => {
                        job.failed_items += 1;
                        job.item_errors.push(ItemError {
                            item_name: item_name.to_string(),
                            error: message.to_string(),
                        });
                    }
                    None => job.processed_items += 1,
                }
                job.updated_at = model::now();
                job_repo::update_in(conn, &job.to_row())?;
                Ok(TransitionOutcome::Applied(job))
            })
            .map(|outcome| self.published(outcome))
    }

    fn transition<F>(
        &self,
        job_id: &str,
        target: JobStatus,
        mutate: F,
    ) -> Result<TransitionOutcome, JobError>
    where
        F: FnOnce(&mut UploadJob),
    {
        self.db
            .with_transaction::<_, _, JobError>(|conn| {
                let mut job = load(conn, job_id)?;
                let current = job.status;

                if current == target || current.is_terminal() {
                    return Ok(TransitionOutcome::Unchanged(job));
                }
                if target == JobStatus::Cancelled && !current.is_cancellable() {
                    return Err(JobError::NotCancellable {
                        job_id: job.id,
                        status: current,
                    });
                }
                if !current.can_transition_to(target) {
                    return Err(JobError::InvalidTransition {
                        job_id: job.id,
                        from: current,
                        to: target,
                    });
                }

                apply_status(&mut job, target);
                mutate(&mut job);
                job_repo::update_in(conn, &job.to_row())?;
                Ok(TransitionOutcome::Applied(job))
            })
            .map(|outcome| self.published(outcome))
    }

    fn published(&self, outcome: TransitionOutcome) -> TransitionOutcome {
        if let TransitionOutcome::Applied(job) = &outcome {
            log::debug!("Job {} is now {}", job.id, job.status);
            self.feed.publish(job.clone());
        }
        outcome
    }
}

fn load(conn: &rusqlite::Connection, job_id: &str) -> Result<UploadJob, JobError> {
    let row = job_repo::find_by_id_in(conn, job_id)?
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
    Ok(UploadJob::from_row(&row)?)
}

fn apply_status(job: &mut UploadJob, target: JobStatus) {
    let now = model::now();
    job.status = target;
    job.updated_at = now;
    if target.is_terminal() {
        job.completed_at = Some(now);
    }
    if target != JobStatus::Failed {
        job.error_message = None;
    }
}
