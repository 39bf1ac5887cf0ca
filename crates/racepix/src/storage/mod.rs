//! Remote object storage.
//!
//! One [`ObjectStore`] instance addresses one bucket. Paths are relative,
//! `/`-separated and validated by [`validate_object_path`] before use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;

use crate::error::StorageError;

pub mod filesystem;
pub mod http;

pub use filesystem::FsObjectStore;
pub use http::{HttpObjectStore, StaticToken, TokenProvider};

/// A successfully written object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Writes (or replaces) the object at `path`.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;

    /// Uploads a local file in a single request.
    async fn put_file(
        &self,
        path: &str,
        local: &Path,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| StorageError::Io {
                path: local.to_path_buf(),
                source,
            })?;
        self.put(path, bytes, content_type).await
    }

    /// Removes the object. Removing a missing object succeeds.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Paths of all objects under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// URL a browser can load the object from.
    fn public_url(&self, path: &str) -> String;

    /// Obtains a fresh credential. Stores without credentials do nothing.
    async fn refresh_credentials(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// `bucket/path` reference recorded on jobs.
    fn storage_ref(&self, path: &str) -> String {
        format!("{}/{}", self.bucket(), path)
    }
}

pub type SharedStore = Arc<dyn ObjectStore>;

/// Rejects absolute paths, traversal and empty segments.
pub fn validate_object_path(path: &str) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidKey(path.to_string());
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(invalid());
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    if path.chars().any(char::is_control) {
        return Err(invalid());
    }
    Ok(())
}

/// Appends `segments` to the path of `base`, percent-encoding each one.
///
/// Empty segments are dropped, so an empty object path adds nothing.
pub(crate) fn append_segments<'a, I>(base: &Url, segments: I) -> Url
where
    I: IntoIterator<Item = &'a str>,
{
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty()
            .extend(segments.into_iter().filter(|s| !s.is_empty()));
    }
    url
}

/// Content type from a file extension, defaulting to octet-stream.
pub fn content_type_for(path: &str) -> &'static str {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
}
