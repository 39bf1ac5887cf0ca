//! Hand-off to the external extraction worker.
//!
//! The worker is told about a job with a single `POST {"jobId": ...}`. Delivery
//! is retried with doubling backoff; when every attempt fails the job is marked
//! `failed`, but only if the worker has not picked it up in the meantime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;

use crate::jobs::{JobError, JobStatus, JobStore};

/// Attempts made before giving up on the worker.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Delay before the second attempt; doubles for each later one.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Keeps worker error bodies out of logs beyond a useful prefix.
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Worker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Worker responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Job(#[from] JobError),
}

/// Something that can tell the worker a job is ready for extraction.
#[async_trait]
pub trait ProcessingNotifier: Send + Sync {
    async fn notify(&self, job_id: &str) -> Result<(), TriggerError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotifyBody<'a> {
    job_id: &'a str,
}

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let cut = (0..=MAX_ERROR_BODY_LENGTH)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... (truncated)", &body[..cut])
    } else {
        body.to_string()
    }
}

/// Notifies the worker over HTTP with a bearer credential.
pub struct HttpWorkerClient {
    client: Client,
    url: String,
    credential: SecretString,
}

impl HttpWorkerClient {
    pub fn new(url: &str, credential: SecretString) -> Result<Self, TriggerError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            credential,
        })
    }
}

#[async_trait]
impl ProcessingNotifier for HttpWorkerClient {
    async fn notify(&self, job_id: &str) -> Result<(), TriggerError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.credential.expose_secret())
            .json(&NotifyBody { job_id })
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TriggerError::Status {
            status: status.as_u16(),
            body: truncate_body(&body),
        })
    }
}

/// What happened to a trigger request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The worker accepted the job on the given attempt (1-based).
    Delivered { attempts: u32 },
    /// Every attempt failed and the job was marked `failed`.
    JobFailed { error: String },
    /// Every attempt failed, but the job had moved on and was left alone.
    Untouched { status: JobStatus },
}

/// Retry schedule for worker notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl TriggerPolicy {
    /// Delay before attempt `attempt` (0-based): nothing, then 1x, 2x, 4x...
    /// `delay_before(attempts)` is the wait before the final status re-check.
    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.base_delay
                .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX))
        }
    }
}

/// Delivers jobs to the worker and escalates undeliverable ones.
#[derive(Clone)]
pub struct ProcessingTrigger {
    notifier: Arc<dyn ProcessingNotifier>,
    store: JobStore,
    policy: TriggerPolicy,
}

impl ProcessingTrigger {
    pub fn new(notifier: Arc<dyn ProcessingNotifier>, store: JobStore, policy: TriggerPolicy) -> Self {
        Self {
            notifier,
            store,
            policy,
        }
    }

    pub async fn trigger(&self, job_id: &str) -> Result<TriggerOutcome, TriggerError> {
        let span = tracing::info_span!("trigger.notify", job_id = %job_id);
        self.run(job_id).instrument(span).await
    }

    async fn run(&self, job_id: &str) -> Result<TriggerOutcome, TriggerError> {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tracing::info!(
                    attempt = attempt + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying worker notification"
                );
                tokio::time::sleep(delay).await;
            }

            match self.notifier.notify(job_id).await {
                Ok(()) => {
                    tracing::info!(attempt = attempt + 1, "Worker accepted job");
                    return Ok(TriggerOutcome::Delivered {
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, attempts, error = %e, "Worker notification failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());
        let message = format!(
            "Processing worker could not be reached after {} attempts: {}",
            attempts, reason
        );

        // The worker may have picked the job up even though we never saw a
        // success response. It gets one more backoff step to show it.
        let grace = self.policy.delay_before(attempts);
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }
        let outcome = self.store.fail_if_in(
            job_id,
            &[JobStatus::Pending, JobStatus::Extracting],
            &message,
        )?;
        if outcome.was_applied() {
            tracing::error!("{}", message);
            Ok(TriggerOutcome::JobFailed { error: message })
        } else {
            let status = outcome.job().status;
            tracing::info!(%status, "Worker unreachable but job already moved on, leaving it");
            Ok(TriggerOutcome::Untouched { status })
        }
    }
}
