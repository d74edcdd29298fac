//! microclimate-export: Pure serializers for rendered land-cover maps (sans-IO)
//!
//! Converts label maps into color-coded rasters for inspection.
//! Persistence is one-way: rendered maps are never decoded back.

pub mod raster;

pub use raster::{
    ExportError, SEGMENTATION_EXTENSION, SEGMENTATION_SUFFIX, encode_png, render,
    render_png, segmentation_file_name,
};
