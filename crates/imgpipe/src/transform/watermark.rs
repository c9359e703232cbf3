use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::imageops;
use image::{DynamicImage, Rgba, RgbaImage, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};

use super::{load_image, save_image, Transform};
use crate::error::TransformError;

static BUNDLED_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans.ttf");

const MARGIN: u32 = 10;
/// Text height in pixels when the image is large enough for it.
const PREFERRED_SCALE: f32 = 36.0;
const INK: Rgba<u8> = Rgba([255, 255, 255, 128]);

/// Stamps semi-transparent white text in the bottom-right corner.
pub struct WatermarkTransform {
    text: String,
    font: FontArc,
}

impl WatermarkTransform {
    /// Uses the bundled DejaVu Sans.
    pub fn new(text: String) -> Result<Self, TransformError> {
        let font = FontArc::try_from_slice(BUNDLED_FONT).map_err(|e| TransformError::LoadFont {
            path: "DejaVuSans.ttf".into(),
            reason: e.to_string(),
        })?;
        Self::with_font(text, font)
    }

    pub fn with_font_file(text: String, path: &Path) -> Result<Self, TransformError> {
        let bytes = std::fs::read(path).map_err(|e| TransformError::LoadFont {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let font = FontArc::try_from_vec(bytes).map_err(|e| TransformError::LoadFont {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::with_font(text, font)
    }

    fn with_font(text: String, font: FontArc) -> Result<Self, TransformError> {
        if text.trim().is_empty() {
            return Err(TransformError::InvalidParameters(
                "watermark text must not be empty".to_string(),
            ));
        }
        Ok(Self { text, font })
    }

    fn scale_for(&self, width: u32, height: u32) -> PxScale {
        let (text_width, text_height) = text_size(PREFERRED_SCALE, &self.font, &self.text);
        let available_width = width.saturating_sub(2 * MARGIN) as f32;
        let available_height = height.saturating_sub(2 * MARGIN) as f32;

        let fit = (available_width / text_width.max(1) as f32)
            .min(available_height / text_height.max(1) as f32)
            .min(1.0);
        PxScale::from((PREFERRED_SCALE * fit).max(1.0))
    }

    pub fn stamp(&self, image: &DynamicImage) -> RgbImage {
        let mut canvas = image.to_rgba8();
        let (width, height) = canvas.dimensions();
        let scale = self.scale_for(width, height);
        let (text_width, text_height) = text_size(scale, &self.font, &self.text);

        // Text larger than the image is anchored the same way and clipped.
        let left = width as i32 - MARGIN as i32 - text_width as i32;
        let top = height as i32 - MARGIN as i32 - text_height as i32;

        let mut layer = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 0]));
        draw_text_mut(&mut layer, INK, left, top, scale, &self.font, &self.text);
        imageops::overlay(&mut canvas, &layer, 0, 0);

        DynamicImage::ImageRgba8(canvas).to_rgb8()
    }
}

impl Transform for WatermarkTransform {
    fn name(&self) -> &str {
        "watermark"
    }

    fn apply(&self, source: &Path, dest: &Path) -> Result<(), TransformError> {
        let image = load_image(source)?;
        let stamped = DynamicImage::ImageRgb8(self.stamp(&image));
        save_image(&stamped, dest)
    }
}
