use std::path::Path;

use super::{load_image, save_image, Transform};
use crate::error::TransformError;

/// Gaussian blur with the radius used as sigma.
pub struct BlurTransform {
    radius: f32,
}

impl BlurTransform {
    pub fn new(radius: f32) -> Result<Self, TransformError> {
        if !radius.is_finite() || radius <= 0.0 {
            return Err(TransformError::InvalidParameters(format!(
                "blur radius must be a positive number, got {}",
                radius
            )));
        }
        Ok(Self { radius })
    }
}

impl Transform for BlurTransform {
    fn name(&self) -> &str {
        "blur"
    }

    fn apply(&self, source: &Path, dest: &Path) -> Result<(), TransformError> {
        let image = load_image(source)?;
        let blurred = image.blur(self.radius);
        save_image(&blurred, dest)
    }
}
