use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    with_retry, ArchiveTransport, ProgressSender, RetryPolicy, TransferProgress, TransportError,
    UploadRequest,
};
use crate::storage::SharedStore;

/// Uploads the whole archive in one request through the object store.
///
/// Progress only moves from 0 to 100; an interrupted transfer starts over.
pub struct SingleShotTransport {
    store: SharedStore,
    retry: RetryPolicy,
}

impl SingleShotTransport {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl ArchiveTransport for SingleShotTransport {
    fn name(&self) -> &'static str {
        "single-shot"
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        let span = tracing::info_span!(
            "transport.single_shot",
            job_id = %request.job_id,
            object = %request.object_path
        );
        async {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            progress.send_replace(TransferProgress::new(0, request.size_bytes));

            with_retry(&self.retry, cancel, "archive upload", || async {
                self.store
                    .put_file(&request.object_path, &request.local_path, &request.content_type)
                    .await
                    .map_err(TransportError::from)
            })
            .await?;

            progress.send_replace(TransferProgress::new(request.size_bytes, request.size_bytes));
            tracing::info!(bytes = request.size_bytes, "Archive upload complete");
            Ok(self.store.storage_ref(&request.object_path))
        }
        .instrument(span)
        .await
    }

    async fn discard(&self, object_path: &str) -> Result<(), TransportError> {
        self.store.delete(object_path).await?;
        Ok(())
    }
}
