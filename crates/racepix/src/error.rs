use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RacepixError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Job error: {0}")]
    Job(#[from] crate::jobs::JobError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] crate::trigger::TriggerError),

    #[error("Derivative error: {0}")]
    Derivative(#[from] crate::derivatives::DerivativeError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    #[error("Upload of job '{job_id}' failed: {error}")]
    UploadFailed { job_id: String, error: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config does not match schema: {errors}")]
    SchemaValidation { errors: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Reasons an archive is refused before any job or network call exists.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("File name '{original}' is empty after removing unsafe characters")]
    UnsafeName { original: String },

    #[error("File '{name}' is not a .zip archive")]
    WrongExtension { name: String },

    #[error("File '{name}' is empty")]
    Empty { name: String },

    #[error("File '{name}' is {size} bytes, above the {max} byte limit")]
    TooLarge { name: String, size: u64, max: u64 },

    #[error("File '{name}' is not a valid ZIP archive (bad signature)")]
    BadSignature { name: String },

    #[error("Failed to read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read ZIP directory of '{name}': {reason}")]
    CorruptArchive { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage credentials rejected: {0}")]
    Unauthorized(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("Invalid storage base URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("Storage I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl StorageError {
    /// True for failures caused by an expired or rejected credential.
    pub fn is_auth_error(&self) -> bool {
        match self {
            StorageError::Unauthorized(_) => true,
            StorageError::Status { status, body } => {
                *status == 401 || *status == 403 || looks_like_auth_failure(body)
            }
            _ => false,
        }
    }
}

pub(crate) fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["jwt", "expired", "unauthorized", "invalid token"]
        .iter()
        .any(|needle| lower.contains(needle))
}

pub type Result<T> = std::result::Result<T, RacepixError>;
