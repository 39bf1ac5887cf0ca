//! Archive transports.
//!
//! An [`ArchiveTransport`] moves one local archive to remote storage, reporting
//! progress and honouring a cancellation token. [`select_transport`] probes
//! the resumable endpoint once and picks [`ChunkedTransport`] when it speaks
//! tus, [`SingleShotTransport`] otherwise.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, DatabaseError};
use crate::error::StorageError;
use crate::storage::{SharedStore, TokenProvider};

pub mod chunked;
pub mod single_shot;

pub use chunked::ChunkedTransport;
pub use single_shot::SingleShotTransport;

/// Default chunk size: 6 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 6 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Upload cancelled")]
    Cancelled,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload server responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Upload server reports offset {server} but {expected} was sent")]
    OffsetMismatch { expected: u64, server: u64 },

    #[error("Upload session no longer exists on the server")]
    SessionGone,

    #[error("Resumable protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<TransportError>,
    },
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// Transient failures worth another attempt of the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(e) => !e.is_builder(),
            TransportError::Status { status, .. } => is_retryable_status(*status),
            TransportError::Storage(StorageError::Http(e)) => !e.is_builder(),
            TransportError::Storage(StorageError::Status { status, .. }) => {
                is_retryable_status(*status)
            }
            _ => false,
        }
    }
}

/// 4xx responses are final except timeout, conflict, locked and rate limit.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 423 | 429) || status >= 500
}

/// Progress of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TransferProgress {
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
    pub percentage: u8,
}

impl TransferProgress {
    pub fn new(bytes_uploaded: u64, bytes_total: u64) -> Self {
        let percentage = if bytes_total == 0 {
            100
        } else {
            ((bytes_uploaded as f64 / bytes_total as f64) * 100.0)
                .round()
                .min(100.0) as u8
        };
        Self {
            bytes_uploaded,
            bytes_total,
            percentage,
        }
    }
}

/// Latest-value progress channel; receivers see the most recent update.
pub type ProgressSender = watch::Sender<TransferProgress>;
pub type ProgressReceiver = watch::Receiver<TransferProgress>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    watch::channel(TransferProgress::default())
}

/// One archive to move.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub job_id: String,
    pub local_path: PathBuf,
    /// Destination path inside the archive bucket.
    pub object_path: String,
    pub size_bytes: u64,
    pub content_type: String,
}

/// Delays before each attempt of a single request; the first is usually zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "millis")]
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn immediate(attempts: usize) -> Self {
        Self {
            delays: vec![Duration::ZERO; attempts.max(1)],
        }
    }

    pub fn attempts(&self) -> usize {
        self.delays.len().max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: [0, 1_000, 3_000, 5_000, 10_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delays: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        let ms: Vec<u64> = delays.iter().map(|d| d.as_millis() as u64).collect();
        ms.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        let ms = Vec::<u64>::deserialize(d)?;
        Ok(ms.into_iter().map(Duration::from_millis).collect())
    }
}

#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Uploads the archive and returns its `bucket/path` reference.
    ///
    /// Fails with [`TransportError::Cancelled`] once `cancel` fires.
    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError>;

    /// Removes whatever exists for `object_path`: the stored object and any
    /// unfinished session.
    async fn discard(&self, object_path: &str) -> Result<(), TransportError>;
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = fut => result,
    }
}

/// Retries `op` per `policy` on retryable errors. Sleeps are cancellable.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = policy.attempts();
    let mut last = None;
    for attempt in 0..attempts {
        let delay = policy.delays.get(attempt).copied().unwrap_or_default();
        if !delay.is_zero() {
            cancellable(cancel, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }

        match cancellable(cancel, op()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    attempt = attempt + 1,
                    attempts,
                    error = %e,
                    "{} failed, will retry",
                    what
                );
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(TransportError::RetriesExhausted {
        attempts,
        last: Box::new(
            last.unwrap_or_else(|| TransportError::Protocol(format!("{} never ran", what))),
        ),
    })
}

/// Tuning shared by both transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub chunk_size: usize,
    pub retry: RetryPolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Picks the transport by asking `resumable_endpoint` whether it speaks tus.
pub async fn select_transport(
    options: TransportOptions,
    resumable_endpoint: Option<&str>,
    store: SharedStore,
    db: Database,
    tokens: Arc<dyn TokenProvider>,
) -> Result<Arc<dyn ArchiveTransport>, TransportError> {
    if let Some(endpoint) = resumable_endpoint {
        let client = chunked::build_client()?;
        if chunked::probe(&client, endpoint).await {
            tracing::info!(endpoint, "Using resumable chunked transport");
            return Ok(Arc::new(ChunkedTransport::new(
                client, endpoint, store, db, tokens, options,
            )));
        }
        tracing::warn!(
            endpoint,
            "Resumable endpoint did not advertise tus support, falling back to single-shot uploads"
        );
    }
    Ok(Arc::new(SingleShotTransport::new(store, options.retry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_percentage_rounds() {
        assert_eq!(TransferProgress::new(0, 200).percentage, 0);
        assert_eq!(TransferProgress::new(1, 200).percentage, 1);
        assert_eq!(TransferProgress::new(199, 200).percentage, 100);
        assert_eq!(TransferProgress::new(100, 300).percentage, 33);
        assert_eq!(TransferProgress::new(0, 0).percentage, 100);
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 409, 423, 429, 500, 502, 503] {
            assert!(is_retryable_status(status), "{}", status);
        }
        for status in [400, 401, 403, 404, 410, 413] {
            assert!(!is_retryable_status(status), "{}", status);
        }
        assert!(!TransportError::Cancelled.is_retryable());
        assert!(!TransportError::Protocol("x".into()).is_retryable());
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 5);
        assert_eq!(policy.delays[0], Duration::ZERO);
        assert_eq!(policy.delays[4], Duration::from_secs(10));
    }

    #[test]
    fn test_policy_serializes_as_millis() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();
        assert_eq!(json["delays"], serde_json::json!([0, 1000, 3000, 5000, 10000]));
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_errors() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let cancel = CancellationToken::new();
        let result = with_retry(&RetryPolicy::immediate(3), &cancel, "op", move || async move {
            let calls = counter;
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::Status {
                    status: 503,
                    body: String::new(),
                })
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_final_error() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let cancel = CancellationToken::new();
        let err = with_retry(&RetryPolicy::immediate(5), &cancel, "op", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TransportError::Status {
                status: 403,
                body: String::new(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 403, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhaustion_keeps_last_error() {
        let cancel = CancellationToken::new();
        let err = with_retry(&RetryPolicy::immediate(2), &cancel, "op", || async {
            Err::<(), _>(TransportError::Status {
                status: 500,
                body: "boom".into(),
            })
        })
        .await
        .unwrap_err();
        match err {
            TransportError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, TransportError::Status { status: 500, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            delays: vec![Duration::ZERO, Duration::from_secs(60)],
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = with_retry(&policy, &cancel, "op", || async {
            Err::<(), _>(TransportError::Status {
                status: 503,
                body: String::new(),
            })
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
