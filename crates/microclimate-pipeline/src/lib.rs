//! microclimate-pipeline: Land-cover segmentation core (sans-IO).
//!
//! Turns one aerial image into per-class area fractions through:
//! network inference -> softmax -> bilinear upsampling -> optional
//! confidence boost -> dense CRF refinement -> class frequencies.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! images and byte slices and returns structured data. The filesystem,
//! the metadata document, and the climate archive live in
//! `microclimate-io`.

pub mod classes;
pub mod crf;
pub mod diagnostics;
pub mod frequency;
pub mod model;
pub mod probability;
pub mod refine;
pub mod types;

pub use classes::{LandCover, NUM_CLASSES, NUM_SUBSTANTIVE};
pub use crf::{CrfParams, MeanFieldCrf};
pub use frequency::{ClassFrequencies, ClassHistogram, frequencies};
pub use model::{InputTensor, PreprocessConfig, Preprocessor, SegmentationModel, SegmentationNetwork};
pub use probability::{ClassBias, ConfidenceBoost, softmax, upsample_bilinear};
pub use refine::{ArgmaxRefiner, DenseFieldRefiner, RefinerKind};
pub use types::{
    DISTRIBUTION_TOLERANCE, Dimensions, LabelMap, Logits, PipelineConfig, PipelineError,
    ProbabilityField, RgbImage,
};

/// The derived outputs of segmenting one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    /// Refined per-pixel classes at the source image's resolution.
    pub labels: LabelMap,
    /// Area fraction per substantive class.
    pub frequencies: ClassFrequencies,
}

/// Decode encoded image bytes (PNG, JPEG, BMP, WebP, TIFF) to 8-bit RGB.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgb8())
}

/// Segment one decoded image.
///
/// # Pipeline steps
///
/// 1. Preprocess and run the network, softmax its logits, and upsample
///    the probabilities to the image's resolution
/// 2. Optional per-class confidence boost
/// 3. Refinement (dense CRF by default)
/// 4. Class frequencies over the refined labels
///
/// Preprocessing follows the model's own [`PreprocessConfig`], fixed when
/// the model was built. `config.preprocess` is not consulted here; it only
/// describes how to build a model (see [`SegmentationModel::new`]).
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] for an invalid configuration,
/// [`PipelineError::EmptyField`] for a zero-sized image,
/// [`PipelineError::ClassCountMismatch`] if the network disagrees with
/// the class registry, and propagates network failures.
pub fn segment<N: SegmentationNetwork>(
    image: &RgbImage,
    model: &SegmentationModel<N>,
    config: &PipelineConfig,
) -> Result<Segmentation, PipelineError> {
    config.validate()?;

    // 1. Inference at image resolution.
    let probabilities = model.infer(image)?;

    // 2. Confidence boost.
    let probabilities = config.boost.apply(probabilities);

    // 3. Refinement.
    let labels = config.refiner.build(&config.crf).refine(image, &probabilities);

    // 4. Statistics.
    let frequencies = frequencies(&labels);
    log::debug!(
        "segmented {}x{} image with {}",
        labels.width(),
        labels.height(),
        config.refiner,
    );

    Ok(Segmentation {
        labels,
        frequencies,
    })
}
