pub mod blur;
pub mod resize;
pub mod watermark;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, ImageError, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};

use crate::error::TransformError;

pub use blur::BlurTransform;
pub use resize::ResizeTransform;
pub use watermark::WatermarkTransform;

/// A pixel operation from one image file to another.
///
/// Implementations are pure functions of `source` and their own parameters,
/// so running one twice for the same input yields the same output.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, source: &Path, dest: &Path) -> Result<(), TransformError>;
}

/// Serializable transform parameters as they appear in a topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    Resize { width: u32 },
    Blur { radius: f32 },
    Watermark {
        text: String,
        /// TrueType font file. The bundled DejaVu Sans is used when unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        font: Option<PathBuf>,
    },
}

impl TransformSpec {
    pub fn build(&self) -> Result<Arc<dyn Transform>, TransformError> {
        match self {
            TransformSpec::Resize { width } => Ok(Arc::new(ResizeTransform::new(*width)?)),
            TransformSpec::Blur { radius } => Ok(Arc::new(BlurTransform::new(*radius)?)),
            TransformSpec::Watermark { text, font } => {
                let watermark = match font {
                    Some(path) => WatermarkTransform::with_font_file(text.clone(), path)?,
                    None => WatermarkTransform::new(text.clone())?,
                };
                Ok(Arc::new(watermark))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransformSpec::Resize { .. } => "resize",
            TransformSpec::Blur { .. } => "blur",
            TransformSpec::Watermark { .. } => "watermark",
        }
    }
}

pub(crate) fn load_image(path: &Path) -> Result<DynamicImage, TransformError> {
    let reader = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| TransformError::ReadImage {
            path: path.to_path_buf(),
            source: e,
        })?;

    reader.decode().map_err(|e| match e {
        ImageError::Unsupported(err) => TransformError::UnsupportedFormat(err.to_string()),
        ImageError::IoError(source) => TransformError::ReadImage {
            path: path.to_path_buf(),
            source,
        },
        other => TransformError::Decode {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    })
}

/// Encodes `image` in the format implied by `dest`'s extension.
///
/// The bytes go to a uniquely named sibling first and are renamed over
/// `dest`, so `dest` is either absent, the previous complete output, or the
/// new complete output.
pub(crate) fn save_image(image: &DynamicImage, dest: &Path) -> Result<(), TransformError> {
    let format = ImageFormat::from_path(dest)
        .map_err(|_| TransformError::UnsupportedFormat(dest.display().to_string()))?;

    let temp = temp_sibling(dest);
    let encoded = match format {
        // No alpha channel in JPEG.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(&temp, format),
        _ => image.save_with_format(&temp, format),
    };

    if let Err(e) = encoded {
        let _ = std::fs::remove_file(&temp);
        return Err(match e {
            ImageError::IoError(source) => TransformError::WriteOutput {
                path: dest.to_path_buf(),
                source,
            },
            other => TransformError::Encode {
                path: dest.to_path_buf(),
                message: other.to_string(),
            },
        });
    }

    std::fs::rename(&temp, dest).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        TransformError::WriteOutput {
            path: dest.to_path_buf(),
            source: e,
        }
    })
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()))
}
