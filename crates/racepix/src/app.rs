//! Wiring of the pipeline from a loaded [`Config`].

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, StorageConfig};
use crate::db::Database;
use crate::derivatives::{DerivativeUploader, NoWatermark, OverlayWatermark, Watermark};
use crate::error::{ConfigError, Result};
use crate::jobs::{JobChangeFeed, JobStore};
use crate::orchestrator::BulkUploadOrchestrator;
use crate::storage::{FsObjectStore, HttpObjectStore, SharedStore, TokenProvider};
use crate::transport::select_transport;
use crate::trigger::{HttpWorkerClient, ProcessingTrigger};

/// Everything a command needs, built once per process.
pub struct AppState {
    pub config: Config,
    pub database: Database,
    pub orchestrator: BulkUploadOrchestrator,
    pub uploader: DerivativeUploader,
}

impl AppState {
    /// Opens the database at the configured path.
    pub async fn from_config(config: Config) -> Result<Self> {
        let path = config.database_path().ok_or_else(|| ConfigError::Validation {
            message: "database_path is not set and no home directory was found".to_string(),
        })?;
        let database = Database::open(&path)?;
        Self::with_database(config, database).await
    }

    /// Probes the resumable endpoint, so this needs a runtime.
    pub async fn with_database(config: Config, database: Database) -> Result<Self> {
        let store = JobStore::new(database.clone(), JobChangeFeed::default());
        let tokens: Arc<dyn TokenProvider> = Arc::new(config.storage.credential.clone());

        let archives = build_store(&config.storage, &config.storage.archive_bucket, &tokens)?;
        let transport = select_transport(
            config.transport.options(),
            config.storage.resumable_endpoint.as_deref(),
            archives,
            database.clone(),
            tokens.clone(),
        )
        .await?;

        let worker = HttpWorkerClient::new(&config.worker.url, config.worker.credential.resolve()?)?;
        let trigger = ProcessingTrigger::new(Arc::new(worker), store.clone(), config.worker.policy());
        let orchestrator = BulkUploadOrchestrator::new(store, transport, trigger, config.limits);

        let originals = build_store(&config.storage, &config.storage.originals_bucket, &tokens)?;
        let public = build_store(&config.storage, &config.storage.public_bucket, &tokens)?;
        let watermark: Arc<dyn Watermark> = match &config.derivatives.watermark_path {
            Some(path) => Arc::new(OverlayWatermark::from_path(Path::new(path))?),
            None => Arc::new(NoWatermark),
        };
        let uploader =
            DerivativeUploader::new(originals, public, watermark, config.derivatives.options());

        tracing::debug!(
            archive_bucket = %config.storage.archive_bucket,
            public_bucket = %config.storage.public_bucket,
            "Pipeline ready"
        );

        Ok(Self {
            config,
            database,
            orchestrator,
            uploader,
        })
    }

    pub fn jobs(&self) -> &JobStore {
        self.orchestrator.store()
    }
}

/// One store per bucket, on whichever backend the config names.
pub fn build_store(
    storage: &StorageConfig,
    bucket: &str,
    tokens: &Arc<dyn TokenProvider>,
) -> Result<SharedStore> {
    if let Some(base_url) = &storage.base_url {
        return Ok(Arc::new(HttpObjectStore::new(base_url, bucket, tokens.clone())?));
    }
    let root = storage.local_root.as_deref().ok_or_else(|| ConfigError::Validation {
        message: "storage needs either base_url or local_root".to_string(),
    })?;
    let mut store = FsObjectStore::new(crate::secrets::expand_home(root), bucket);
    if let Some(base) = &storage.public_base_url {
        store = store.with_public_base_url(base);
    }
    Ok(Arc::new(store))
}
