//! Color-coded raster rendering of label maps.
//!
//! Each pixel's class id is mapped to its registry color by direct
//! lookup. Ids outside the registry (which a valid [`LabelMap`] never
//! holds) render as black, the zero-initialized background.

use image::ImageEncoder;
use microclimate_pipeline::{LabelMap, LandCover, RgbImage};

/// Suffix appended to a source image's stem to name its rendered map.
pub const SEGMENTATION_SUFFIX: &str = "_seg";

/// File extension of rendered maps.
pub const SEGMENTATION_EXTENSION: &str = "png";

/// Errors that can occur while encoding a rendered map.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// PNG encoding failed.
    #[error("PNG encoding failed: {0}")]
    PngEncode(#[from] image::ImageError),
}

/// Render a label map with the registry's color table.
#[must_use = "returns the rendered raster"]
pub fn render(labels: &LabelMap) -> RgbImage {
    let mut raster = RgbImage::new(labels.width(), labels.height());
    for (pixel, &id) in raster.pixels_mut().zip(labels.as_raw()) {
        if let Some(class) = LandCover::from_id(id) {
            pixel.0 = class.color();
        }
    }
    raster
}

/// Encode an RGB raster as PNG bytes.
///
/// # Errors
///
/// Returns [`ExportError::PngEncode`] if PNG encoding fails.
pub fn encode_png(raster: &RgbImage) -> Result<Vec<u8>, ExportError> {
    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder.write_image(
        raster.as_raw(),
        raster.width(),
        raster.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(png_bytes)
}

/// Render a label map and encode it as PNG bytes.
///
/// # Errors
///
/// Returns [`ExportError::PngEncode`] if PNG encoding fails.
pub fn render_png(labels: &LabelMap) -> Result<Vec<u8>, ExportError> {
    encode_png(&render(labels))
}

/// File name of the rendered map for a source image stem, e.g.
/// `site_2019` becomes `site_2019_seg.png`.
#[must_use]
pub fn segmentation_file_name(stem: &str) -> String {
    format!("{stem}{SEGMENTATION_SUFFIX}.{SEGMENTATION_EXTENSION}")
}
