pub mod app;
pub mod archive;
pub mod config;
pub mod db;
pub mod derivatives;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod sanitize;
pub mod secrets;
pub mod storage;
pub mod transport;
pub mod trigger;

pub use app::AppState;
pub use config::{load_config, Config};
pub use db::Database;
pub use derivatives::{upload_batch, BatchResult, DerivativeUploader, PhotoUpload};
pub use error::{ConfigError, RacepixError, Result, StorageError, ValidationError};
pub use jobs::{JobChangeFeed, JobError, JobStatus, JobStore, UploadJob};
pub use orchestrator::{ArchiveUpload, BulkUploadOrchestrator, UploadOutcome};
pub use sanitize::{sanitize_filename, validate_archive_file, ArchiveLimits};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError, SecretSource};
pub use storage::{FsObjectStore, HttpObjectStore, ObjectStore};
pub use transport::{ArchiveTransport, TransportError};
pub use trigger::{ProcessingTrigger, TriggerOutcome};
