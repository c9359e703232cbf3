use std::path::Path;

use image::imageops::FilterType;

use super::{load_image, save_image, Transform};
use crate::error::TransformError;

/// Scales to a fixed width, keeping the aspect ratio.
pub struct ResizeTransform {
    width: u32,
}

impl ResizeTransform {
    pub fn new(width: u32) -> Result<Self, TransformError> {
        if width == 0 {
            return Err(TransformError::InvalidParameters(
                "resize width must be positive".to_string(),
            ));
        }
        Ok(Self { width })
    }

    pub fn target_height(&self, width: u32, height: u32) -> u32 {
        let scaled = (height as f64 * self.width as f64 / width.max(1) as f64).round();
        (scaled as u32).max(1)
    }
}

impl Transform for ResizeTransform {
    fn name(&self) -> &str {
        "resize"
    }

    fn apply(&self, source: &Path, dest: &Path) -> Result<(), TransformError> {
        let image = load_image(source)?;
        let height = self.target_height(image.width(), image.height());
        let resized = image.resize_exact(self.width, height, FilterType::Lanczos3);
        save_image(&resized, dest)
    }
}
