//! Resumable chunked uploads over the tus 1.0.0 protocol.
//!
//! A session is created with `POST`, continued with `PATCH` carrying
//! `Upload-Offset`, inspected with `HEAD` and terminated with `DELETE`.
//! Session URLs are recorded in the `resumable_uploads` table keyed by
//! `bucket/path:size`, so an interrupted transfer resumes from the server's
//! acknowledged offset even after a restart.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode, Url};
use secrecy::ExposeSecret;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    with_retry, ArchiveTransport, ProgressSender, RetryPolicy, TransferProgress,
    TransportError, TransportOptions, UploadRequest,
};
use crate::db::resume_repo::{self, ResumeRow};
use crate::db::Database;
use crate::storage::{SharedStore, TokenProvider};

const TUS_RESUMABLE: &str = "Tus-Resumable";
const TUS_VERSION: &str = "1.0.0";
const UPLOAD_OFFSET: &str = "Upload-Offset";
const UPLOAD_LENGTH: &str = "Upload-Length";
const UPLOAD_METADATA: &str = "Upload-Metadata";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for one request; a 6 MiB chunk on a slow uplink fits comfortably.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) fn build_client() -> Result<Client, TransportError> {
    Ok(Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()?)
}

/// True when `OPTIONS endpoint` advertises tus support.
pub(crate) async fn probe(client: &Client, endpoint: &str) -> bool {
    match client.request(reqwest::Method::OPTIONS, endpoint).send().await {
        Ok(response) => {
            let headers = response.headers();
            response.status().is_success()
                && (headers.contains_key(TUS_RESUMABLE) || headers.contains_key("Tus-Version"))
        }
        Err(e) => {
            tracing::warn!(endpoint, error = %e, "Resumable endpoint probe failed");
            false
        }
    }
}

/// Reads fixed-size chunks from any offset of a local file.
struct ChunkReader {
    file: tokio::fs::File,
    path: PathBuf,
    size: u64,
}

impl ChunkReader {
    async fn open(path: &Path) -> Result<Self, TransportError> {
        let io = |source| TransportError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io)?;
        let size = file.metadata().await.map_err(io)?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }

    async fn read_at(&mut self, offset: u64, max: usize) -> Result<Vec<u8>, TransportError> {
        let len = (self.size.saturating_sub(offset)).min(max as u64) as usize;
        let mut buf = vec![0u8; len];
        let path = &self.path;
        let io = |source| TransportError::Io {
            path: path.clone(),
            source,
        };
        self.file.seek(SeekFrom::Start(offset)).await.map_err(io)?;
        self.file.read_exact(&mut buf).await.map_err(io)?;
        Ok(buf)
    }
}

fn header_u64(response: &Response, name: &str) -> Result<u64, TransportError> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("missing or invalid {} header", name)))
}

async fn status_error(response: Response) -> TransportError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return TransportError::SessionGone;
    }
    TransportError::Status {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    }
}

fn metadata_header(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{} {}", key, STANDARD.encode(value)))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct ChunkedTransport {
    client: Client,
    endpoint: String,
    store: SharedStore,
    db: Database,
    tokens: Arc<dyn TokenProvider>,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl ChunkedTransport {
    pub fn new(
        client: Client,
        endpoint: &str,
        store: SharedStore,
        db: Database,
        tokens: Arc<dyn TokenProvider>,
        options: TransportOptions,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            store,
            db,
            tokens,
            chunk_size: options.chunk_size.max(1),
            retry: options.retry,
        }
    }

    fn fingerprint(&self, request: &UploadRequest) -> String {
        format!(
            "{}/{}:{}",
            self.store.bucket(),
            request.object_path,
            request.size_bytes
        )
    }

    async fn bearer(&self) -> Result<String, TransportError> {
        Ok(self.tokens.fetch_token().await?.expose_secret().to_string())
    }

    async fn create_session(&self, request: &UploadRequest) -> Result<String, TransportError> {
        let metadata = metadata_header(&[
            ("bucketName", self.store.bucket()),
            ("objectName", &request.object_path),
            ("contentType", &request.content_type),
        ]);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.bearer().await?)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_LENGTH, request.size_bytes)
            .header(UPLOAD_METADATA, metadata)
            .header("x-upsert", "true")
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(status_error(response).await);
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransportError::Protocol("session created without Location".into()))?;
        let base = Url::parse(&self.endpoint)
            .map_err(|e| TransportError::Protocol(format!("invalid endpoint: {}", e)))?;
        let url = base
            .join(location)
            .map_err(|e| TransportError::Protocol(format!("invalid Location: {}", e)))?;
        Ok(url.to_string())
    }

    async fn server_offset(&self, url: &str) -> Result<u64, TransportError> {
        let response = self
            .client
            .head(url)
            .bearer_auth(self.bearer().await?)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        header_u64(&response, UPLOAD_OFFSET)
    }

    /// Sends one chunk and returns the new acknowledged offset.
    async fn patch_chunk(&self, url: &str, offset: u64, chunk: &[u8]) -> Result<u64, TransportError> {
        let response = self
            .client
            .patch(url)
            .bearer_auth(self.bearer().await?)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_OFFSET, offset)
            .header(reqwest::header::CONTENT_TYPE, OFFSET_CONTENT_TYPE)
            .body(chunk.to_vec())
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let server = self.server_offset(url).await?;
            return Err(TransportError::OffsetMismatch {
                expected: offset,
                server,
            });
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let acknowledged = header_u64(&response, UPLOAD_OFFSET)?;
        if acknowledged <= offset && !chunk.is_empty() {
            return Err(TransportError::Protocol(format!(
                "server acknowledged offset {} after a chunk sent at {}",
                acknowledged, offset
            )));
        }
        Ok(acknowledged)
    }

    async fn terminate(&self, url: &str) {
        let bearer = match self.bearer().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot terminate upload session without credentials");
                return;
            }
        };
        let result = self
            .client
            .delete(url)
            .bearer_auth(bearer)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await;
        match result {
            Ok(response)
                if response.status().is_success()
                    || response.status() == StatusCode::NOT_FOUND
                    || response.status() == StatusCode::GONE => {}
            Ok(response) => {
                tracing::warn!(status = %response.status(), "Upload session termination refused")
            }
            Err(e) => tracing::warn!(error = %e, "Upload session termination failed"),
        }
    }

    /// Resumes a recorded session or opens a new one. Returns `(url, offset)`.
    async fn open_session(
        &self,
        request: &UploadRequest,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, u64), TransportError> {
        if let Some(row) = resume_repo::find(&self.db, fingerprint)? {
            let resumed = with_retry(&self.retry, cancel, "resume offset lookup", || {
                self.server_offset(&row.upload_url)
            })
            .await;
            match resumed {
                Ok(offset) if offset <= request.size_bytes => {
                    tracing::info!(offset, total = request.size_bytes, "Resuming interrupted upload");
                    return Ok((row.upload_url, offset));
                }
                Ok(offset) => {
                    tracing::warn!(offset, "Recorded session is ahead of the file, starting over");
                }
                Err(TransportError::SessionGone) => {
                    tracing::info!("Recorded upload session expired, starting over");
                }
                Err(e) => return Err(e),
            }
            resume_repo::remove(&self.db, fingerprint)?;
        }

        let url = with_retry(&self.retry, cancel, "session creation", || {
            self.create_session(request)
        })
        .await?;
        resume_repo::upsert(
            &self.db,
            &ResumeRow {
                fingerprint: fingerprint.to_string(),
                upload_url: url.clone(),
                object_key: request.object_path.clone(),
                total_bytes: request.size_bytes as i64,
                created_at: Utc::now().to_rfc3339(),
            },
        )?;
        Ok((url, 0))
    }

    async fn transfer(
        &self,
        request: &UploadRequest,
        fingerprint: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let total = request.size_bytes;
        let mut reader = ChunkReader::open(&request.local_path).await?;
        if reader.size != total {
            return Err(TransportError::Protocol(format!(
                "file is {} bytes but {} were announced",
                reader.size, total
            )));
        }

        let (mut url, mut offset) = self.open_session(request, fingerprint, cancel).await?;
        progress.send_replace(TransferProgress::new(offset, total));

        let mut mismatches = 0;
        let mut restarted = false;
        while offset < total {
            let chunk = reader.read_at(offset, self.chunk_size).await?;
            let sent = with_retry(&self.retry, cancel, "chunk upload", || {
                self.patch_chunk(&url, offset, &chunk)
            })
            .await;

            match sent {
                Ok(acknowledged) => {
                    offset = acknowledged.min(total);
                    progress.send_replace(TransferProgress::new(offset, total));
                    tracing::debug!(offset, total, "Chunk acknowledged");
                }
                Err(TransportError::OffsetMismatch { server, expected }) => {
                    mismatches += 1;
                    if mismatches > self.retry.attempts() || server > total {
                        return Err(TransportError::OffsetMismatch { expected, server });
                    }
                    tracing::warn!(expected, server, "Offset mismatch, continuing from server offset");
                    offset = server;
                    progress.send_replace(TransferProgress::new(offset, total));
                }
                Err(TransportError::SessionGone) if !restarted => {
                    tracing::warn!("Upload session vanished mid-transfer, starting a new one");
                    restarted = true;
                    resume_repo::remove(&self.db, fingerprint)?;
                    let (new_url, new_offset) =
                        self.open_session(request, fingerprint, cancel).await?;
                    url = new_url;
                    offset = new_offset;
                    progress.send_replace(TransferProgress::new(offset, total));
                }
                Err(e) => {
                    if e.is_cancelled() {
                        self.terminate(&url).await;
                        resume_repo::remove(&self.db, fingerprint)?;
                    }
                    return Err(e);
                }
            }
        }

        resume_repo::remove(&self.db, fingerprint)?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveTransport for ChunkedTransport {
    fn name(&self) -> &'static str {
        "chunked"
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        let span = tracing::info_span!(
            "transport.chunked",
            job_id = %request.job_id,
            object = %request.object_path,
            size = request.size_bytes
        );
        async {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let fingerprint = self.fingerprint(request);
            // Not wrapped in `cancellable`: the transfer loop observes the
            // token itself so it can terminate the server session.
            self.transfer(request, &fingerprint, progress, cancel).await?;
            tracing::info!("Archive upload complete");
            Ok(self.store.storage_ref(&request.object_path))
        }
        .instrument(span)
        .await
    }

    async fn discard(&self, object_path: &str) -> Result<(), TransportError> {
        for row in resume_repo::find_for_key(&self.db, object_path)? {
            self.terminate(&row.upload_url).await;
        }
        resume_repo::remove_for_key(&self.db, object_path)?;
        self.store.delete(object_path).await?;
        Ok(())
    }
}
