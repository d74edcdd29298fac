//! Logit-to-probability conversion, resampling, and confidence boosting.
//!
//! The network reports logits at a coarse resolution. Before refinement
//! they are turned into a [`ProbabilityField`] aligned pixel-for-pixel
//! with the source image:
//!
//! 1. [`softmax`] over the class axis at network resolution,
//! 2. [`upsample_bilinear`] to the image's width and height,
//! 3. optionally [`ConfidenceBoost::apply`] to bias selected classes.
//!
//! Interpolation and renormalization both preserve the per-pixel
//! distribution invariant.

use serde::{Deserialize, Serialize};

use crate::classes::{LandCover, NUM_CLASSES};
use crate::types::{Dimensions, Logits, PipelineError, ProbabilityField};

/// Softmax over the class axis of a logit tensor.
///
/// Computed in `f64` with the per-pixel maximum subtracted, so large
/// logits do not overflow.
///
/// # Errors
///
/// Returns [`PipelineError::ClassCountMismatch`] if the logits do not have
/// exactly one channel per registered class.
pub fn softmax(logits: &Logits) -> Result<ProbabilityField, PipelineError> {
    if logits.classes() != NUM_CLASSES {
        return Err(PipelineError::ClassCountMismatch {
            expected: NUM_CLASSES,
            actual: logits.classes(),
        });
    }

    let dimensions = logits.dimensions();
    let pixels = dimensions.pixel_count();
    let raw = logits.as_raw();
    let mut data = vec![0.0; NUM_CLASSES * pixels];

    for i in 0..pixels {
        let max = (0..NUM_CLASSES)
            .map(|c| f64::from(raw[c * pixels + i]))
            .fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for c in 0..NUM_CLASSES {
            let e = (f64::from(raw[c * pixels + i]) - max).exp();
            data[c * pixels + i] = e;
            sum += e;
        }
        for c in 0..NUM_CLASSES {
            data[c * pixels + i] /= sum;
        }
    }

    Ok(ProbabilityField::from_raw_unchecked(dimensions, data))
}

/// Source sample for one output coordinate under half-pixel-center
/// (`align_corners = false`) bilinear resampling.
///
/// Returns the two neighboring input indices and the weight of the
/// second one.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn source_index(scale: f64, dst: usize, in_size: usize) -> (usize, usize, f64) {
    let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(in_size - 1);
    let i1 = (i0 + 1).min(in_size - 1);
    (i0, i1, src - i0 as f64)
}

/// Bilinearly resample a probability field to `target` dimensions.
///
/// Uses half-pixel-center sampling (`align_corners = false`), clamping
/// at the borders. Each output pixel is a convex combination of four
/// input distributions, so it is itself a distribution.
#[must_use = "returns the resampled field"]
#[allow(clippy::cast_precision_loss)]
pub fn upsample_bilinear(field: &ProbabilityField, target: Dimensions) -> ProbabilityField {
    let source = field.dimensions();
    if source == target {
        return field.clone();
    }

    let (in_w, in_h) = (source.width as usize, source.height as usize);
    let (out_w, out_h) = (target.width as usize, target.height as usize);
    let scale_x = in_w as f64 / out_w as f64;
    let scale_y = in_h as f64 / out_h as f64;

    let columns: Vec<(usize, usize, f64)> = (0..out_w)
        .map(|x| source_index(scale_x, x, in_w))
        .collect();

    let in_pixels = source.pixel_count();
    let out_pixels = target.pixel_count();
    let raw = field.as_raw();
    let mut data = vec![0.0; NUM_CLASSES * out_pixels];

    for y in 0..out_h {
        let (y0, y1, ly) = source_index(scale_y, y, in_h);
        for (x, &(x0, x1, lx)) in columns.iter().enumerate() {
            let w00 = (1.0 - ly) * (1.0 - lx);
            let w01 = (1.0 - ly) * lx;
            let w10 = ly * (1.0 - lx);
            let w11 = ly * lx;
            for c in 0..NUM_CLASSES {
                let plane = &raw[c * in_pixels..(c + 1) * in_pixels];
                data[c * out_pixels + y * out_w + x] = w00 * plane[y0 * in_w + x0]
                    + w01 * plane[y0 * in_w + x1]
                    + w10 * plane[y1 * in_w + x0]
                    + w11 * plane[y1 * in_w + x1];
            }
        }
    }

    ProbabilityField::from_raw_unchecked(target, data)
}

/// An additive bias for one class channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassBias {
    /// The class whose probability is raised.
    pub class: LandCover,
    /// Amount added to the class probability before renormalizing.
    pub bias: f64,
}

/// Per-class confidence boosting applied before refinement.
///
/// The network systematically under-detects thin structures such as
/// roads. Adding a small constant to selected class channels and
/// renormalizing each pixel compensates. Disabled by default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfidenceBoost(Vec<ClassBias>);

impl ConfidenceBoost {
    /// Road bias of the thin-structure preset.
    pub const ROAD_BIAS: f64 = 0.15;

    /// Building bias of the thin-structure preset.
    pub const BUILDING_BIAS: f64 = 0.1;

    /// No boosting.
    #[must_use]
    pub const fn none() -> Self {
        Self(Vec::new())
    }

    /// Preset that favors roads and buildings.
    #[must_use]
    pub fn thin_structures() -> Self {
        Self(vec![
            ClassBias {
                class: LandCover::Road,
                bias: Self::ROAD_BIAS,
            },
            ClassBias {
                class: LandCover::Building,
                bias: Self::BUILDING_BIAS,
            },
        ])
    }

    /// Add a bias for `class`.
    #[must_use]
    pub fn with(mut self, class: LandCover, bias: f64) -> Self {
        self.0.push(ClassBias { class, bias });
        self
    }

    /// Whether no class is boosted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The configured biases.
    #[must_use]
    pub fn biases(&self) -> &[ClassBias] {
        &self.0
    }

    /// Check that every bias is finite and non-negative.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first bad bias.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self.0.iter().find(|b| !b.bias.is_finite() || b.bias < 0.0) {
            Some(bad) => Err(PipelineError::InvalidConfig(format!(
                "confidence boost for {} must be finite and non-negative, got {}",
                bad.class, bad.bias,
            ))),
            None => Ok(()),
        }
    }

    /// Add each bias to its class channel, then renormalize every pixel
    /// to sum to one.
    ///
    /// Returns the field unchanged when no biases are configured.
    #[must_use = "returns the boosted field"]
    pub fn apply(&self, field: ProbabilityField) -> ProbabilityField {
        if self.is_empty() {
            return field;
        }

        let dimensions = field.dimensions();
        let pixels = dimensions.pixel_count();
        let mut data = field.into_raw();

        for bias in &self.0 {
            let start = bias.class.index() * pixels;
            for p in &mut data[start..start + pixels] {
                *p += bias.bias.max(0.0);
            }
        }

        for i in 0..pixels {
            let sum: f64 = (0..NUM_CLASSES).map(|c| data[c * pixels + i]).sum();
            for c in 0..NUM_CLASSES {
                data[c * pixels + i] /= sum;
            }
        }

        ProbabilityField::from_raw_unchecked(dimensions, data)
    }
}
