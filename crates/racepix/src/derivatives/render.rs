//! Synchronous image work. Callers run these on the blocking pool.

use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat};

use super::{DerivativeError, DerivativeOptions, Stage, Watermark};

/// Format of a photo, sniffed from its bytes.
///
/// Its extension names all three objects of the photo and the public copies
/// are encoded in it, so every object's name matches its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
    WebP,
}

impl OutputFormat {
    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
            ImageFormat::Png => Some(OutputFormat::Png),
            ImageFormat::Gif => Some(OutputFormat::Gif),
            ImageFormat::Bmp => Some(OutputFormat::Bmp),
            ImageFormat::Tiff => Some(OutputFormat::Tiff),
            ImageFormat::WebP => Some(OutputFormat::WebP),
            _ => None,
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Gif => ImageFormat::Gif,
            OutputFormat::Bmp => ImageFormat::Bmp,
            OutputFormat::Tiff => ImageFormat::Tiff,
            OutputFormat::WebP => ImageFormat::WebP,
        }
    }

    /// Canonical extension (`jpg`, never `jpeg`).
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
            OutputFormat::Bmp => "bmp",
            OutputFormat::Tiff => "tiff",
            OutputFormat::WebP => "webp",
        }
    }
}

/// Decodes a photo and reports the format its bytes are actually in.
pub fn decode(bytes: &[u8], name: &str) -> Result<(DynamicImage, OutputFormat), DerivativeError> {
    let failed = |reason: String| DerivativeError::Decode {
        name: name.to_string(),
        reason,
    };
    let detected = image::guess_format(bytes).map_err(|e| failed(e.to_string()))?;
    let format = OutputFormat::from_image_format(detected)
        .ok_or_else(|| failed(format!("unsupported image format {:?}", detected)))?;
    let image =
        image::load_from_memory_with_format(bytes, detected).map_err(|e| failed(e.to_string()))?;
    Ok((image, format))
}

pub fn encode(
    image: &DynamicImage,
    format: OutputFormat,
    quality: u8,
    stage: Stage,
) -> Result<Vec<u8>, DerivativeError> {
    let mut out = Cursor::new(Vec::new());
    let result = match format {
        // JPEG has no alpha channel.
        OutputFormat::Jpeg => image
            .to_rgb8()
            .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))),
        other => DynamicImage::ImageRgba8(image.to_rgba8()).write_to(&mut out, other.image_format()),
    };
    result.map_err(|e| DerivativeError::Encode {
        stage,
        reason: e.to_string(),
    })?;
    Ok(out.into_inner())
}

/// Produces the watermarked copy and a thumbnail of it.
pub fn render_public(
    image: DynamicImage,
    watermark: &dyn Watermark,
    format: OutputFormat,
    options: &DerivativeOptions,
) -> Result<(Vec<u8>, Vec<u8>), DerivativeError> {
    let _span = tracing::debug_span!("derivatives.render").entered();

    let marked = watermark.apply(image)?;
    let watermarked = encode(&marked, format, options.jpeg_quality, Stage::Watermarked)?;

    let edge = options.thumbnail_edge.max(1);
    let thumb = marked.thumbnail(edge, edge);
    let thumbnail = encode(&thumb, format, options.jpeg_quality, Stage::Thumbnail)?;

    Ok((watermarked, thumbnail))
}

/// Publishes photos unmarked.
pub struct NoWatermark;

impl Watermark for NoWatermark {
    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, DerivativeError> {
        Ok(image)
    }
}

/// Stamps a mark image into the bottom-right corner.
///
/// The mark is scaled to at most a quarter of the photo's width.
pub struct OverlayWatermark {
    mark: DynamicImage,
}

const MARK_MARGIN: u32 = 16;

impl OverlayWatermark {
    pub fn new(mark: DynamicImage) -> Self {
        Self { mark }
    }

    pub fn from_path(path: &Path) -> Result<Self, DerivativeError> {
        let mark = image::open(path).map_err(|e| DerivativeError::Decode {
            name: crate::sanitize::redact_path(path),
            reason: e.to_string(),
        })?;
        Ok(Self::new(mark))
    }
}

impl Watermark for OverlayWatermark {
    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, DerivativeError> {
        let mut base = image.to_rgba8();
        let max_width = (base.width() / 4).max(1);
        let mark = if self.mark.width() > max_width {
            let height = (self.mark.height() as u64 * max_width as u64 / self.mark.width() as u64)
                .max(1) as u32;
            self.mark.resize_exact(max_width, height, FilterType::Triangle)
        } else {
            self.mark.clone()
        };
        if mark.height() > base.height() {
            return Err(DerivativeError::Watermark(format!(
                "mark is {}px tall but the photo only {}px",
                mark.height(),
                base.height()
            )));
        }

        let x = base.width().saturating_sub(mark.width() + MARK_MARGIN);
        let y = base.height().saturating_sub(mark.height() + MARK_MARGIN);
        imageops::overlay(&mut base, &mark.to_rgba8(), x as i64, y as i64);
        Ok(DynamicImage::ImageRgba8(base))
    }
}
