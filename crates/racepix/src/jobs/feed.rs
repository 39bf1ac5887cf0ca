//! Change feed for upload jobs.
//!
//! Every committed update is published as a full [`UploadJob`] snapshot.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::model::UploadJob;

/// Broadcasts job snapshots to any number of subscribers.
#[derive(Clone)]
pub struct JobChangeFeed {
    sender: Arc<broadcast::Sender<UploadJob>>,
}

impl JobChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, job: UploadJob) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(job);
    }

    /// Receives updates for every job.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadJob> {
        self.sender.subscribe()
    }

    /// Receives updates for a single job.
    pub fn watch(&self, job_id: &str) -> JobWatch {
        JobWatch {
            job_id: job_id.to_string(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Invokes `callback` for every update of `job_id` on a background task
    /// until the returned [`Subscription`] is dropped.
    pub fn subscribe_with<F>(&self, job_id: &str, mut callback: F) -> Subscription
    where
        F: FnMut(UploadJob) + Send + 'static,
    {
        let mut watch = self.watch(job_id);
        let handle = tokio::spawn(async move {
            while let Some(job) = watch.next().await {
                callback(job);
            }
        });
        Subscription { handle }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobChangeFeed {
    fn default() -> Self {
        Self::new(100)
    }
}

/// A receiver filtered to one job id.
pub struct JobWatch {
    job_id: String,
    receiver: broadcast::Receiver<UploadJob>,
}

impl JobWatch {
    /// Next snapshot for this job, or `None` once the feed is gone.
    ///
    /// A lagging receiver skips the dropped snapshots; the next one it
    /// sees is still a full record.
    pub async fn next(&mut self) -> Option<UploadJob> {
        loop {
            match self.receiver.recv().await {
                Ok(job) if job.id == self.job_id => return Some(job),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %self.job_id, skipped, "Job watcher lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Handle for a callback subscription. Dropping it stops delivery.
#[must_use = "dropping a Subscription ends it immediately"]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobStatus;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    fn job(id: &str, status: JobStatus) -> UploadJob {
        let now = Utc::now();
        UploadJob {
            id: id.to_string(),
            event_id: "evt".to_string(),
            user_id: "usr".to_string(),
            status,
            archive_ref: None,
            archive_name: "a.zip".to_string(),
            archive_size_bytes: 1,
            total_items: None,
            processed_items: 0,
            failed_items: 0,
            item_errors: vec![],
            file_manifest: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_watch_filters_by_job_id() {
        let feed = JobChangeFeed::default();
        let mut watch = feed.watch("a");

        feed.publish(job("b", JobStatus::Uploading));
        feed.publish(job("a", JobStatus::Extracting));

        let received = watch.next().await.unwrap();
        assert_eq!(received.id, "a");
        assert_eq!(received.status, JobStatus::Extracting);
    }

    #[tokio::test]
    async fn test_watch_ends_when_feed_dropped() {
        let feed = JobChangeFeed::default();
        let mut watch = feed.watch("a");
        drop(feed);
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let feed = JobChangeFeed::new(4);
        feed.publish(job("a", JobStatus::Pending));
        assert_eq!(feed.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_delivers_until_dropped() {
        let feed = JobChangeFeed::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = feed.subscribe_with("a", move |job| {
            sink.lock().unwrap().push(job.status);
        });

        feed.publish(job("a", JobStatus::Uploading));
        feed.publish(job("a", JobStatus::Extracting));
        for _ in 0..50 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![JobStatus::Uploading, JobStatus::Extracting]
        );

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        feed.publish(job("a", JobStatus::Failed));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
