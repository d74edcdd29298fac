//! Shared types for the land-cover segmentation pipeline.

use serde::{Deserialize, Serialize};

use crate::classes::{LandCover, NUM_CLASSES};
use crate::crf::CrfParams;
use crate::model::PreprocessConfig;
use crate::probability::ConfidenceBoost;
use crate::refine::RefinerKind;

/// Re-export `RgbImage` so downstream crates can pass source imagery
/// without depending on `image` directly.
pub use image::RgbImage;

/// Tolerance used when validating that a pixel's class probabilities
/// sum to one.
pub const DISTRIBUTION_TOLERANCE: f64 = 1e-6;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of an RGB image.
    #[must_use]
    pub fn of(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Number of pixels (`width * height`).
    #[must_use]
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Raw per-class scores produced by the segmentation network, at the
/// network's native output resolution.
///
/// Layout is `[class][row][col]`, row-major within each class plane.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    classes: usize,
    dimensions: Dimensions,
    data: Vec<f32>,
}

impl Logits {
    /// Wrap a class-major logit buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyField`] if any dimension is zero and
    /// [`PipelineError::BufferLength`] if `data` does not hold exactly
    /// `classes * width * height` values.
    pub fn new(classes: usize, width: u32, height: u32, data: Vec<f32>) -> Result<Self, PipelineError> {
        let dimensions = Dimensions { width, height };
        if classes == 0 || dimensions.pixel_count() == 0 {
            return Err(PipelineError::EmptyField { width, height });
        }
        let expected = classes * dimensions.pixel_count();
        if data.len() != expected {
            return Err(PipelineError::BufferLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            classes,
            dimensions,
            data,
        })
    }

    /// Number of class channels.
    #[must_use]
    pub const fn classes(&self) -> usize {
        self.classes
    }

    /// Spatial dimensions of each class plane.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// The raw class-major buffer.
    #[must_use]
    pub fn as_raw(&self) -> &[f32] {
        &self.data
    }
}

/// Per-pixel probability distribution over the land-cover classes.
///
/// Layout is `[class][row][col]`. Every pixel's values lie in `[0, 1]`
/// and sum to one within [`DISTRIBUTION_TOLERANCE`]; the constructors
/// enforce this, so every `ProbabilityField` that exists is valid.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityField {
    dimensions: Dimensions,
    data: Vec<f64>,
}

impl ProbabilityField {
    /// Wrap and validate a class-major probability buffer with
    /// [`NUM_CLASSES`] channels.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyField`] for zero-sized dimensions,
    /// [`PipelineError::BufferLength`] for a wrongly sized buffer, and
    /// [`PipelineError::NotADistribution`] for the first pixel whose
    /// values fall outside `[0, 1]` or do not sum to one.
    pub fn new(width: u32, height: u32, data: Vec<f64>) -> Result<Self, PipelineError> {
        let dimensions = Dimensions { width, height };
        let pixels = dimensions.pixel_count();
        if pixels == 0 {
            return Err(PipelineError::EmptyField { width, height });
        }
        let expected = NUM_CLASSES * pixels;
        if data.len() != expected {
            return Err(PipelineError::BufferLength {
                expected,
                actual: data.len(),
            });
        }
        let field = Self { dimensions, data };
        field.validate()?;
        Ok(field)
    }

    /// Construct without validation. Callers inside the crate guarantee
    /// the invariant by construction (softmax, interpolation of valid
    /// distributions, renormalization).
    pub(crate) const fn from_raw_unchecked(dimensions: Dimensions, data: Vec<f64>) -> Self {
        Self { dimensions, data }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn validate(&self) -> Result<(), PipelineError> {
        let pixels = self.dimensions.pixel_count();
        for i in 0..pixels {
            let mut sum = 0.0;
            let mut in_range = true;
            for c in 0..NUM_CLASSES {
                let p = self.data[c * pixels + i];
                in_range &= (0.0..=1.0).contains(&p);
                sum += p;
            }
            if !in_range || (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
                let width = self.dimensions.width as usize;
                return Err(PipelineError::NotADistribution {
                    x: (i % width) as u32,
                    y: (i / width) as u32,
                    sum,
                });
            }
        }
        Ok(())
    }

    /// Spatial dimensions of the field.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Probability of `class` at pixel `(x, y)`.
    #[must_use]
    pub fn probability(&self, class: LandCover, x: u32, y: u32) -> f64 {
        let pixels = self.dimensions.pixel_count();
        self.data[class.index() * pixels + self.offset(x, y)]
    }

    /// The full distribution at pixel `(x, y)`, indexed by class id.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [f64; NUM_CLASSES] {
        let pixels = self.dimensions.pixel_count();
        let offset = self.offset(x, y);
        std::array::from_fn(|c| self.data[c * pixels + offset])
    }

    /// One class plane, row-major.
    #[must_use]
    pub fn channel(&self, class: LandCover) -> &[f64] {
        let pixels = self.dimensions.pixel_count();
        let start = class.index() * pixels;
        &self.data[start..start + pixels]
    }

    /// The raw class-major buffer.
    #[must_use]
    pub fn as_raw(&self) -> &[f64] {
        &self.data
    }

    /// Consume the field and return its class-major buffer.
    #[must_use]
    pub fn into_raw(self) -> Vec<f64> {
        self.data
    }

    const fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.dimensions.width as usize + x as usize
    }
}

/// A per-pixel land-cover label map.
///
/// Every entry is a valid [`LandCover`] id and the map is never empty;
/// both are checked at construction. There are no mutating accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    dimensions: Dimensions,
    labels: Vec<u8>,
}

impl LabelMap {
    /// Wrap and validate a row-major buffer of class ids.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyField`] for zero-sized dimensions,
    /// [`PipelineError::BufferLength`] for a wrongly sized buffer, and
    /// [`PipelineError::InvalidLabel`] for the first unregistered id.
    pub fn new(width: u32, height: u32, labels: Vec<u8>) -> Result<Self, PipelineError> {
        let dimensions = Dimensions { width, height };
        if dimensions.pixel_count() == 0 {
            return Err(PipelineError::EmptyField { width, height });
        }
        if labels.len() != dimensions.pixel_count() {
            return Err(PipelineError::BufferLength {
                expected: dimensions.pixel_count(),
                actual: labels.len(),
            });
        }
        if let Some((index, &id)) = labels
            .iter()
            .enumerate()
            .find(|&(_, &id)| LandCover::from_id(id).is_none())
        {
            return Err(PipelineError::InvalidLabel { id, index });
        }
        Ok(Self { dimensions, labels })
    }

    /// Build a label map by evaluating `f` at every pixel.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyField`] for zero-sized dimensions.
    pub fn from_fn(
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> LandCover,
    ) -> Result<Self, PipelineError> {
        let dimensions = Dimensions { width, height };
        if dimensions.pixel_count() == 0 {
            return Err(PipelineError::EmptyField { width, height });
        }
        let mut labels = Vec::with_capacity(dimensions.pixel_count());
        for y in 0..height {
            for x in 0..width {
                labels.push(f(x, y).id());
            }
        }
        Ok(Self { dimensions, labels })
    }

    /// Construct from ids the caller has already guaranteed are valid.
    pub(crate) const fn from_raw_unchecked(dimensions: Dimensions, labels: Vec<u8>) -> Self {
        Self { dimensions, labels }
    }

    /// Spatial dimensions of the map.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.dimensions.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// Number of pixels.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.labels.len()
    }

    /// The class at pixel `(x, y)`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> LandCover {
        let id = self.labels[y as usize * self.dimensions.width as usize + x as usize];
        LandCover::from_id(id).unwrap_or(LandCover::Background)
    }

    /// Row-major class ids.
    #[must_use]
    pub fn as_raw(&self) -> &[u8] {
        &self.labels
    }
}

/// Configuration for segmenting one image.
///
/// All numeric fields are part of the output contract: changing any of
/// them changes region boundaries, so runs are only comparable when the
/// config matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Network input preparation, used when building a
    /// [`SegmentationModel`](crate::SegmentationModel). Segmenting with an
    /// existing model always uses that model's preprocessing.
    pub preprocess: PreprocessConfig,

    /// Additive per-class biases applied before refinement.
    pub boost: ConfidenceBoost,

    /// Which refinement backend to run.
    pub refiner: RefinerKind,

    /// Dense CRF hyperparameters (used by [`RefinerKind::DenseCrf`]).
    pub crf: CrfParams,
}

impl PipelineConfig {
    /// Default network input edge length.
    pub const DEFAULT_INPUT_SIZE: u32 = PreprocessConfig::DEFAULT_SIZE;

    /// Default number of mean-field iterations.
    pub const DEFAULT_ITERATIONS: u32 = CrfParams::DEFAULT_ITERATIONS;

    /// Default refinement backend.
    pub const DEFAULT_REFINER: RefinerKind = RefinerKind::DenseCrf;

    /// Check the boost and CRF parameters.
    ///
    /// Preprocessing is checked when the model is constructed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for the first invalid
    /// parameter.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.boost.validate()?;
        self.crf.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preprocess: PreprocessConfig::default(),
            boost: ConfidenceBoost::none(),
            refiner: Self::DEFAULT_REFINER,
            crf: CrfParams::default(),
        }
    }
}

/// Errors that can occur while segmenting an image.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// A field or map was requested with a zero dimension.
    #[error("field dimensions must be non-zero, got {width}x{height}")]
    EmptyField {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// A raw buffer did not match its declared dimensions.
    #[error("buffer holds {actual} values, expected {expected}")]
    BufferLength {
        /// Length implied by the dimensions.
        expected: usize,
        /// Length supplied.
        actual: usize,
    },

    /// A label map contained an id outside the class registry.
    #[error("label id {id} at index {index} is not a registered class")]
    InvalidLabel {
        /// The offending id.
        id: u8,
        /// Row-major pixel index.
        index: usize,
    },

    /// A pixel's class probabilities do not form a distribution.
    #[error("pixel ({x}, {y}) is not a probability distribution (sum = {sum})")]
    NotADistribution {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
        /// Sum of the pixel's values.
        sum: f64,
    },

    /// The network produced a different number of classes than the
    /// registry defines.
    #[error("network produced {actual} classes, registry defines {expected}")]
    ClassCountMismatch {
        /// Registry class count.
        expected: usize,
        /// Network output channels.
        actual: usize,
    },

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The network backend failed.
    #[error("segmentation network failed: {0}")]
    Network(String),
}
