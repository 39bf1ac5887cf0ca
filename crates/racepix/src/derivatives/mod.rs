//! Per-photo derivative uploads.
//!
//! Every photo becomes three objects sharing one generated id:
//!
//! - `{event}/photo-{id}.{ext}` in the private originals bucket
//! - `{event}/watermarked/photo-{id}.{ext}` in the public bucket
//! - `{event}/thumbnails/photo-{id}.{ext}` in the public bucket
//!
//! `{ext}` is the canonical extension of the format sniffed from the photo's
//! bytes, and the public copies are encoded in that same format.
//!
//! Uploads run in that order. If any step fails, objects already written by
//! the same call are deleted in reverse order before the error is returned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::StorageError;
use crate::sanitize::redact_path;
use crate::storage::{content_type_for, SharedStore};

pub mod batch;
pub mod render;

pub use batch::{upload_batch, BatchFailure, BatchProgress, BatchResult};
pub use render::{NoWatermark, OverlayWatermark, OutputFormat};

/// Upload steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Original,
    Watermarked,
    Thumbnail,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Original => "original",
            Stage::Watermarked => "watermarked",
            Stage::Thumbnail => "thumbnail",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum DerivativeError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{name}' is not a decodable image: {reason}")]
    Decode { name: String, reason: String },

    #[error("Watermarking failed: {0}")]
    Watermark(String),

    #[error("Failed to encode {stage} image: {reason}")]
    Encode { stage: Stage, reason: String },

    #[error("Failed to upload {stage} image: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },

    #[error("Image rendering task failed: {0}")]
    Task(String),
}

impl DerivativeError {
    /// Failures that a fresh storage credential may cure.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, DerivativeError::Storage { source, .. } if source.is_auth_error())
    }
}

/// Opaque image transform applied to the public copy of a photo.
pub trait Watermark: Send + Sync {
    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, DerivativeError>;
}

/// Rendering knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeOptions {
    /// Longest edge of a thumbnail, in pixels.
    #[serde(default = "default_thumbnail_edge")]
    pub thumbnail_edge: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_thumbnail_edge() -> u32 {
    400
}

fn default_jpeg_quality() -> u8 {
    85
}

impl Default for DerivativeOptions {
    fn default() -> Self {
        Self {
            thumbnail_edge: default_thumbnail_edge(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Storage paths of one photo's three objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivativePaths {
    pub original: String,
    pub watermarked: String,
    pub thumbnail: String,
}

impl DerivativePaths {
    pub fn new(event_id: &str, photo_id: &str, ext: &str) -> Self {
        Self {
            original: format!("{}/photo-{}.{}", event_id, photo_id, ext),
            watermarked: format!("{}/watermarked/photo-{}.{}", event_id, photo_id, ext),
            thumbnail: format!("{}/thumbnails/photo-{}.{}", event_id, photo_id, ext),
        }
    }
}

/// A photo whose three objects are all stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUpload {
    pub photo_id: String,
    pub file_name: String,
    pub paths: DerivativePaths,
    /// `bucket/path` of the private original.
    pub original_ref: String,
    pub watermarked_url: String,
    pub thumbnail_url: String,
    pub original_size_bytes: u64,
    pub width: u32,
    pub height: u32,
}

/// Objects written so far by one upload, deleted newest first on failure.
struct Rollback {
    written: Vec<(SharedStore, String)>,
}

impl Rollback {
    fn new() -> Self {
        Self {
            written: Vec::new(),
        }
    }

    fn record(&mut self, store: &SharedStore, path: &str) {
        self.written.push((store.clone(), path.to_string()));
    }

    async fn run(self) {
        for (store, path) in self.written.into_iter().rev() {
            match store.delete(&path).await {
                Ok(()) => tracing::debug!(object = %path, "Rolled back object"),
                Err(e) => {
                    tracing::warn!(object = %path, error = %e, "Rollback failed, object may be orphaned")
                }
            }
        }
    }
}

/// Uploads the three objects of a photo.
#[derive(Clone)]
pub struct DerivativeUploader {
    originals: SharedStore,
    public: SharedStore,
    watermark: Arc<dyn Watermark>,
    options: DerivativeOptions,
}

impl DerivativeUploader {
    pub fn new(
        originals: SharedStore,
        public: SharedStore,
        watermark: Arc<dyn Watermark>,
        options: DerivativeOptions,
    ) -> Self {
        Self {
            originals,
            public,
            watermark,
            options,
        }
    }

    /// Asks both stores for fresh credentials.
    pub async fn refresh_credentials(&self) -> Result<(), StorageError> {
        self.originals.refresh_credentials().await?;
        self.public.refresh_credentials().await
    }

    /// Uploads `local` as a photo of `event_id`.
    ///
    /// All three objects exist when this returns `Ok`; none of them do when it
    /// returns `Err`, barring a rollback delete that itself failed (logged).
    pub async fn upload_photo(
        &self,
        event_id: &str,
        local: &Path,
    ) -> Result<PhotoUpload, DerivativeError> {
        let file_name = redact_path(local);
        let span = tracing::info_span!("derivatives.photo", event_id = %event_id, file = %file_name);
        async {
            let bytes = tokio::fs::read(local)
                .await
                .map_err(|source| DerivativeError::Io {
                    path: local.to_path_buf(),
                    source,
                })?;

            // Decode before touching storage: a non-image never leaves a trace.
            let name = file_name.clone();
            let (image, format, bytes) = blocking(move || {
                let (image, format) = render::decode(&bytes, &name)?;
                Ok((image, format, bytes))
            })
            .await?;

            let photo_id = Uuid::new_v4().to_string();
            let paths = DerivativePaths::new(event_id, &photo_id, format.extension());

            let mut rollback = Rollback::new();
            let stored = self
                .store_all(&paths, bytes, image, format, &mut rollback)
                .await;
            match stored {
                Ok((original_size_bytes, width, height)) => {
                    tracing::info!(photo_id = %photo_id, "Photo uploaded");
                    Ok(PhotoUpload {
                        original_ref: self.originals.storage_ref(&paths.original),
                        watermarked_url: self.public.public_url(&paths.watermarked),
                        thumbnail_url: self.public.public_url(&paths.thumbnail),
                        photo_id,
                        file_name: file_name.clone(),
                        paths,
                        original_size_bytes,
                        width,
                        height,
                    })
                }
                Err(e) => {
                    tracing::warn!(photo_id = %photo_id, error = %e, "Photo upload failed, rolling back");
                    rollback.run().await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn store_all(
        &self,
        paths: &DerivativePaths,
        original: Vec<u8>,
        image: DynamicImage,
        format: OutputFormat,
        rollback: &mut Rollback,
    ) -> Result<(u64, u32, u32), DerivativeError> {
        let (width, height) = (image.width(), image.height());
        let original_size = original.len() as u64;

        put(&self.originals, &paths.original, original, Stage::Original).await?;
        rollback.record(&self.originals, &paths.original);

        let watermark = self.watermark.clone();
        let options = self.options;
        let (watermarked, thumbnail) =
            blocking(move || render::render_public(image, watermark.as_ref(), format, &options))
                .await?;

        put(&self.public, &paths.watermarked, watermarked, Stage::Watermarked).await?;
        rollback.record(&self.public, &paths.watermarked);

        put(&self.public, &paths.thumbnail, thumbnail, Stage::Thumbnail).await?;
        rollback.record(&self.public, &paths.thumbnail);

        Ok((original_size, width, height))
    }
}

async fn put(
    store: &SharedStore,
    path: &str,
    bytes: Vec<u8>,
    stage: Stage,
) -> Result<(), DerivativeError> {
    store
        .put(path, bytes, content_type_for(path))
        .await
        .map(|_| ())
        .map_err(|source| DerivativeError::Storage { stage, source })
}

/// Runs CPU-bound image work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, DerivativeError>
where
    F: FnOnce() -> Result<T, DerivativeError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DerivativeError::Task(e.to_string()))?
}
