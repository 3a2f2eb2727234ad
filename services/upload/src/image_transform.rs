//! Width bounding and re-encoding of stored raster images.
//!
//! The transform is best-effort: any failure leaves the stored file exactly
//! as it was written, and callers only log the error.

use crate::config::ImageConfig;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that can occur while transforming an image
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
}

/// What the transform did to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Scaled down to the width bound and re-encoded
    Resized {
        from: (u32, u32),
        to: (u32, u32),
    },
    /// Re-encoded at the original size because the result was smaller
    Recompressed { before: u64, after: u64 },
    /// Left untouched; re-encoding would not have saved space
    Unchanged,
}

impl TransformOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TransformOutcome::Resized { .. } => "resized",
            TransformOutcome::Recompressed { .. } => "recompressed",
            TransformOutcome::Unchanged => "unchanged",
        }
    }
}

/// Bounds image width and re-encodes in place
#[derive(Debug, Clone)]
pub struct ImageTransform {
    max_width: u32,
    quality: u8,
    extensions: Vec<String>,
}

impl ImageTransform {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            max_width: config.max_width,
            quality: config.quality,
            extensions: config
                .extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether files with this extension should be transformed
    pub fn applies_to(&self, extension: Option<&str>) -> bool {
        extension
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }

    /// Transform the image at `path` in place
    ///
    /// Blocking; run it on a blocking thread from async code. The new bytes
    /// are written next to the file and renamed over it, so readers see
    /// either the old or the new image.
    ///
    /// An image already within `max_width` is still re-encoded, but the
    /// result only replaces the file when it is smaller; otherwise the file
    /// is left alone and [`TransformOutcome::Unchanged`] is returned.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn apply(&self, path: &Path) -> Result<TransformOutcome, TransformError> {
        let original = std::fs::read(path)?;
        let format = image::guess_format(&original)
            .map_err(|e| TransformError::Decode(e.to_string()))?;
        let img = image::load_from_memory_with_format(&original, format)
            .map_err(|e| TransformError::Decode(e.to_string()))?;

        let (width, height) = (img.width(), img.height());
        let target = bounded_dimensions(width, height, self.max_width);

        let img = match target {
            Some((w, h)) => img.resize_exact(w, h, FilterType::Lanczos3),
            None => img,
        };

        let encoded = self.encode(&img, format)?;

        let outcome = match target {
            Some(to) => TransformOutcome::Resized {
                from: (width, height),
                to,
            },
            None if (encoded.len() as u64) < original.len() as u64 => {
                TransformOutcome::Recompressed {
                    before: original.len() as u64,
                    after: encoded.len() as u64,
                }
            }
            None => {
                debug!(
                    size_bytes = original.len(),
                    reencoded_bytes = encoded.len(),
                    "Re-encoding would not shrink image, keeping original"
                );
                return Ok(TransformOutcome::Unchanged);
            }
        };

        replace_file(path, &encoded)?;

        debug!(outcome = outcome.label(), "Image transformed");
        Ok(outcome)
    }

    /// Encode in the same container the upload arrived in
    fn encode(&self, img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, TransformError> {
        let mut buf = Cursor::new(Vec::new());

        match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut buf, self.quality);
                // JPEG has no alpha channel
                DynamicImage::ImageRgb8(img.to_rgb8())
                    .write_with_encoder(encoder)
                    .map_err(|e| TransformError::Encode(format!("JPEG: {e}")))?;
            }
            ImageFormat::Png => {
                let encoder = PngEncoder::new_with_quality(
                    &mut buf,
                    CompressionType::Best,
                    PngFilter::Adaptive,
                );
                img.write_with_encoder(encoder)
                    .map_err(|e| TransformError::Encode(format!("PNG: {e}")))?;
            }
            ImageFormat::Gif => {
                DynamicImage::ImageRgba8(img.to_rgba8())
                    .write_to(&mut buf, ImageFormat::Gif)
                    .map_err(|e| TransformError::Encode(format!("GIF: {e}")))?;
            }
            other => return Err(TransformError::UnsupportedFormat(format!("{other:?}"))),
        }

        Ok(buf.into_inner())
    }
}

/// New dimensions when `width` exceeds `max_width`, keeping the aspect ratio
pub fn bounded_dimensions(width: u32, height: u32, max_width: u32) -> Option<(u32, u32)> {
    if width <= max_width {
        return None;
    }

    let new_height = (u64::from(height) * u64::from(max_width) / u64::from(width)).max(1);
    Some((max_width, new_height as u32))
}

fn replace_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = sibling_temp_path(path);

    if let Err(e) = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    Ok(())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.transform"))
}
