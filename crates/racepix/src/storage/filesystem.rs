use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Url;
use walkdir::WalkDir;

use super::{append_segments, validate_object_path, ObjectStore, StoredObject};
use crate::error::StorageError;

/// Object store backed by a local directory: `{root}/{bucket}/{path}`.
pub struct FsObjectStore {
    bucket: String,
    bucket_dir: PathBuf,
    public_base_url: Option<String>,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P, bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            bucket_dir: root.as_ref().join(bucket),
            public_base_url: None,
        }
    }

    /// Serves [`ObjectStore::public_url`] from `base` instead of `file://`.
    pub fn with_public_base_url(mut self, base: &str) -> Self {
        self.public_base_url = Some(base.trim_end_matches('/').to_string());
        self
    }

    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_object_path(path)?;
        Ok(self.bucket_dir.join(path))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }

        // Write beside the target, then rename so readers never see a partial object.
        let staging = target.with_extension(format!("{}.partial", uuid::Uuid::new_v4()));
        let size_bytes = bytes.len() as u64;
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(io_error(&staging))?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_error(&target)(e));
        }

        Ok(StoredObject {
            path: path.to_string(),
            size_bytes,
        })
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&target)(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.bucket_dir.clone();
        let prefix = prefix.to_string();
        let listed = tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(|e| StorageError::Io {
                path: self.bucket_dir.clone(),
                source: std::io::Error::other(e),
            })??;
        let mut paths: Vec<String> = listed
            .into_iter()
            .filter(|p| p.starts_with(&prefix))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn public_url(&self, path: &str) -> String {
        match &self.public_base_url {
            Some(base) => match Url::parse(base) {
                Ok(base) => {
                    let segments = std::iter::once(self.bucket.as_str()).chain(path.split('/'));
                    append_segments(&base, segments).into()
                }
                Err(_) => format!("{}/{}/{}", base, self.bucket, path),
            },
            None => format!("file://{}", self.bucket_dir.join(path).display()),
        }
    }
}

/// Relative `/`-joined paths of every regular file under `root`.
fn walk(root: &Path) -> Result<Vec<String>, StorageError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| StorageError::Io {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() || entry.path().to_string_lossy().ends_with(".partial") {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            let joined = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            found.push(joined);
        }
    }
    Ok(found)
}
