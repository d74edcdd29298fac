//! Label refinement: turn a probability field into a label map.
//!
//! This module defines the [`DenseFieldRefiner`] trait for pluggable
//! refinement backends and the [`RefinerKind`] enum for selecting one at
//! runtime.
//!
//! # Strategy pattern
//!
//! The dense CRF is expensive and its output depends on every
//! hyperparameter, so an argmax backend is kept alongside it for quick
//! previews and for comparing what the CRF changes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classes::NUM_CLASSES;
use crate::crf::{CrfParams, MeanFieldCrf};
use crate::types::{Dimensions, LabelMap, ProbabilityField, RgbImage};

/// Selects which refinement backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefinerKind {
    /// Mean-field dense CRF with smoothness and appearance kernels.
    #[default]
    DenseCrf,

    /// Per-pixel argmax with no spatial reasoning.
    Argmax,
}

impl RefinerKind {
    /// Every refiner, in declaration order.
    pub const ALL: [Self; 2] = [Self::DenseCrf, Self::Argmax];

    /// Instantiate the selected backend.
    #[must_use]
    pub fn build(self, crf: &CrfParams) -> Box<dyn DenseFieldRefiner + Send + Sync> {
        match self {
            Self::DenseCrf => Box::new(MeanFieldCrf::new(crf.clone())),
            Self::Argmax => Box::new(ArgmaxRefiner),
        }
    }
}

impl fmt::Display for RefinerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DenseCrf => f.write_str("dense-crf"),
            Self::Argmax => f.write_str("argmax"),
        }
    }
}

/// Trait for refinement strategies.
///
/// Input: the source image and a probability field of the same
/// dimensions. Output: a label map of those dimensions whose every entry
/// is a registered class id.
///
/// # Panics
///
/// Implementations may panic if the image and field dimensions differ.
pub trait DenseFieldRefiner {
    /// Assign one class to every pixel.
    fn refine(&self, image: &RgbImage, probabilities: &ProbabilityField) -> LabelMap;
}

/// Picks the most probable class per pixel. Ties go to the lower id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgmaxRefiner;

impl DenseFieldRefiner for ArgmaxRefiner {
    #[allow(clippy::cast_possible_truncation)]
    fn refine(&self, image: &RgbImage, probabilities: &ProbabilityField) -> LabelMap {
        let dimensions = probabilities.dimensions();
        assert_eq!(
            Dimensions::of(image),
            dimensions,
            "image and probability field must share dimensions",
        );

        let pixels = dimensions.pixel_count();
        let raw = probabilities.as_raw();
        let labels = (0..pixels)
            .map(|i| {
                let mut best = 0;
                for c in 1..NUM_CLASSES {
                    if raw[c * pixels + i] > raw[best * pixels + i] {
                        best = c;
                    }
                }
                best as u8
            })
            .collect();

        LabelMap::from_raw_unchecked(dimensions, labels)
    }
}
