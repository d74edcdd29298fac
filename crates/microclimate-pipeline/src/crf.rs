//! Fully connected conditional random field refinement.
//!
//! Mean-field inference over a dense CRF with Potts compatibility and two
//! Gaussian pairwise kernels:
//!
//! - a **smoothness** kernel over pixel position only, and
//! - an **appearance** (bilateral) kernel over position and RGB color.
//!
//! Unary potentials are `-ln(max(p, unary_clip))` of the network's class
//! probabilities. Each iteration computes, per kernel `m`,
//!
//! ```text
//! msg_m(i, l) = n_m(i) * sum_j k_m(i, j) * n_m(j) * Q(j, l)
//! ```
//!
//! with symmetric normalization `n_m(i) = 1 / sqrt(sum_j k_m(i, j))`,
//! then sets `Q(i, l) ∝ exp(-U(i, l) + sum_m w_m * msg_m(i, l))`.
//!
//! Kernels are evaluated exactly inside a window of `window_sigmas`
//! spatial standard deviations. The smoothness kernel is separable and
//! filtered in two 1-D passes; the appearance kernel is filtered with a
//! direct windowed sum. Rows are processed in parallel with `rayon`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classes::NUM_CLASSES;
use crate::refine::DenseFieldRefiner;
use crate::types::{Dimensions, LabelMap, PipelineError, ProbabilityField, RgbImage};

/// Guards the normalizer against division by zero.
const NORM_EPSILON: f32 = 1e-20;

/// Dense CRF hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrfParams {
    /// Spatial standard deviation of the smoothness kernel, in pixels.
    pub gaussian_sxy: f32,
    /// Potts weight of the smoothness kernel.
    pub gaussian_compat: f32,
    /// Spatial standard deviation of the appearance kernel, in pixels.
    pub bilateral_sxy: f32,
    /// Color standard deviation of the appearance kernel, in 8-bit units.
    pub bilateral_srgb: f32,
    /// Potts weight of the appearance kernel.
    pub bilateral_compat: f32,
    /// Number of mean-field iterations.
    pub iterations: u32,
    /// Probabilities are clipped to at least this before taking the log.
    pub unary_clip: f64,
    /// Kernel window half-width, in multiples of the spatial sigma.
    pub window_sigmas: f32,
}

impl CrfParams {
    /// Default number of mean-field iterations.
    pub const DEFAULT_ITERATIONS: u32 = 5;

    /// Check every parameter is in range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// out-of-range parameter.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let positive = [
            ("gaussian_sxy", self.gaussian_sxy),
            ("bilateral_sxy", self.bilateral_sxy),
            ("bilateral_srgb", self.bilateral_srgb),
            ("window_sigmas", self.window_sigmas),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "crf.{name} must be positive, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("gaussian_compat", self.gaussian_compat),
            ("bilateral_compat", self.bilateral_compat),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "crf.{name} must be non-negative, got {value}"
                )));
            }
        }
        if !(self.unary_clip > 0.0 && self.unary_clip < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "crf.unary_clip must be in (0, 1), got {}",
                self.unary_clip
            )));
        }
        Ok(())
    }
}

impl Default for CrfParams {
    fn default() -> Self {
        Self {
            gaussian_sxy: 3.0,
            gaussian_compat: 4.0,
            bilateral_sxy: 3.0,
            bilateral_srgb: 20.0,
            bilateral_compat: 5.0,
            iterations: Self::DEFAULT_ITERATIONS,
            unary_clip: 1e-5,
            window_sigmas: 3.0,
        }
    }
}

/// Mean-field dense CRF refiner.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanFieldCrf {
    params: CrfParams,
}

impl MeanFieldCrf {
    /// Create a refiner with the given hyperparameters.
    #[must_use]
    pub const fn new(params: CrfParams) -> Self {
        Self { params }
    }

    /// The active hyperparameters.
    #[must_use]
    pub const fn params(&self) -> &CrfParams {
        &self.params
    }
}

impl DenseFieldRefiner for MeanFieldCrf {
    fn refine(&self, image: &RgbImage, probabilities: &ProbabilityField) -> LabelMap {
        let dimensions = probabilities.dimensions();
        assert_eq!(
            Dimensions::of(image),
            dimensions,
            "image and probability field must share dimensions",
        );
        let q = mean_field(&self.params, image, probabilities);
        LabelMap::from_raw_unchecked(dimensions, argmax_labels(&q))
    }
}

/// Row-major grid shape shared by every buffer in one inference run.
#[derive(Debug, Clone, Copy)]
struct Grid {
    width: usize,
    height: usize,
}

impl Grid {
    const fn pixels(self) -> usize {
        self.width * self.height
    }
}

/// Run mean-field inference and return the final pixel-major marginals.
fn mean_field(params: &CrfParams, image: &RgbImage, field: &ProbabilityField) -> Vec<f32> {
    let dimensions = field.dimensions();
    let grid = Grid {
        width: dimensions.width as usize,
        height: dimensions.height as usize,
    };
    let n = grid.pixels();

    let unary = unary_potentials(field, params.unary_clip);
    let mut q = unary.iter().map(|&u| -u).collect::<Vec<f32>>();
    exp_normalize(&mut q);

    if params.iterations == 0 {
        return q;
    }

    let smooth_kernel = gaussian_taps(params.gaussian_sxy, params.window_sigmas);
    let appearance = Appearance::new(image, params);

    let ones = vec![1.0_f32; n];
    let smooth_norm = normalizer(&separable_filter(&ones, 1, grid, &smooth_kernel));
    let appearance_norm = normalizer(&appearance.filter(&ones, 1, grid));

    for _ in 0..params.iterations {
        let smooth = symmetric_message(&q, &smooth_norm, |buf| {
            separable_filter(buf, NUM_CLASSES, grid, &smooth_kernel)
        });
        let bilateral = symmetric_message(&q, &appearance_norm, |buf| {
            appearance.filter(buf, NUM_CLASSES, grid)
        });

        q.par_chunks_mut(NUM_CLASSES)
            .enumerate()
            .for_each(|(i, pixel)| {
                for (l, value) in pixel.iter_mut().enumerate() {
                    let k = i * NUM_CLASSES + l;
                    *value = params.gaussian_compat.mul_add(
                        smooth[k],
                        params.bilateral_compat.mul_add(bilateral[k], -unary[k]),
                    );
                }
            });
        exp_normalize(&mut q);
    }

    q
}

/// Pixel-major `-ln(max(p, clip))`.
#[allow(clippy::cast_possible_truncation)]
fn unary_potentials(field: &ProbabilityField, clip: f64) -> Vec<f32> {
    let pixels = field.dimensions().pixel_count();
    let raw = field.as_raw();
    let mut unary = vec![0.0; pixels * NUM_CLASSES];
    for c in 0..NUM_CLASSES {
        for i in 0..pixels {
            unary[i * NUM_CLASSES + c] = -(raw[c * pixels + i].max(clip).ln()) as f32;
        }
    }
    unary
}

/// In-place softmax over each pixel's class energies.
fn exp_normalize(q: &mut [f32]) {
    q.par_chunks_mut(NUM_CLASSES).for_each(|pixel| {
        let max = pixel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for value in pixel.iter_mut() {
            *value = (*value - max).exp();
            sum += *value;
        }
        for value in pixel.iter_mut() {
            *value /= sum;
        }
    });
}

/// `1 / sqrt(k_sum + eps)` per pixel.
fn normalizer(kernel_sums: &[f32]) -> Vec<f32> {
    kernel_sums
        .iter()
        .map(|&s| 1.0 / (s + NORM_EPSILON).sqrt())
        .collect()
}

/// `n ⊙ filter(n ⊙ q)` for a pixel-major multi-channel buffer.
fn symmetric_message(q: &[f32], norm: &[f32], filter: impl Fn(&[f32]) -> Vec<f32>) -> Vec<f32> {
    let scaled: Vec<f32> = q
        .iter()
        .enumerate()
        .map(|(k, &v)| v * norm[k / NUM_CLASSES])
        .collect();
    let mut out = filter(&scaled);
    out.iter_mut()
        .enumerate()
        .for_each(|(k, v)| *v *= norm[k / NUM_CLASSES]);
    out
}

/// First index wins ties.
#[allow(clippy::cast_possible_truncation)]
fn argmax_labels(q: &[f32]) -> Vec<u8> {
    q.chunks_exact(NUM_CLASSES)
        .map(|pixel| {
            let mut best = 0;
            for (l, &value) in pixel.iter().enumerate().skip(1) {
                if value > pixel[best] {
                    best = l;
                }
            }
            best as u8
        })
        .collect()
}

/// Window half-width in pixels for a kernel of spatial sigma `sxy`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn window_radius(sxy: f32, window_sigmas: f32) -> usize {
    (sxy * window_sigmas).ceil().max(1.0) as usize
}

/// 1-D Gaussian taps `exp(-d² / 2σ²)` for `d` in `-r..=r`, unnormalized.
#[allow(clippy::cast_precision_loss)]
fn gaussian_taps(sxy: f32, window_sigmas: f32) -> Vec<f32> {
    let radius = window_radius(sxy, window_sigmas);
    let r = radius as isize;
    (-r..=r)
        .map(|d| {
            let d = d as f32;
            (-0.5 * d * d / (sxy * sxy)).exp()
        })
        .collect()
}

/// Separable Gaussian filter of a pixel-major buffer with `channels`
/// values per pixel. Samples outside the grid contribute nothing.
fn separable_filter(input: &[f32], channels: usize, grid: Grid, taps: &[f32]) -> Vec<f32> {
    let radius = taps.len() / 2;
    let row_len = grid.width * channels;

    let mut horizontal = vec![0.0_f32; input.len()];
    horizontal
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            let src = &input[y * row_len..(y + 1) * row_len];
            for x in 0..grid.width {
                let lo = x.saturating_sub(radius);
                let hi = (x + radius).min(grid.width - 1);
                let out = &mut row[x * channels..(x + 1) * channels];
                for xx in lo..=hi {
                    let w = taps[xx + radius - x];
                    let sample = &src[xx * channels..(xx + 1) * channels];
                    for (o, &s) in out.iter_mut().zip(sample) {
                        *o = w.mul_add(s, *o);
                    }
                }
            }
        });

    let mut output = vec![0.0_f32; input.len()];
    output
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            let lo = y.saturating_sub(radius);
            let hi = (y + radius).min(grid.height - 1);
            for yy in lo..=hi {
                let w = taps[yy + radius - y];
                let src = &horizontal[yy * row_len..(yy + 1) * row_len];
                for (o, &s) in row.iter_mut().zip(src) {
                    *o = w.mul_add(s, *o);
                }
            }
        });

    output
}

/// Bilateral kernel state: color features and the spatial weight table.
struct Appearance {
    radius: usize,
    /// `(2r+1)²` spatial weights, row-major over `(dy, dx)`.
    spatial: Vec<f32>,
    /// Per-pixel RGB scaled by `1 / srgb`.
    features: Vec<[f32; 3]>,
}

impl Appearance {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    fn new(image: &RgbImage, params: &CrfParams) -> Self {
        let radius = window_radius(params.bilateral_sxy, params.window_sigmas);
        let r = radius as isize;
        let inv_var = 1.0 / (params.bilateral_sxy * params.bilateral_sxy);
        let mut spatial = Vec::with_capacity((2 * radius + 1) * (2 * radius + 1));
        for dy in -r..=r {
            for dx in -r..=r {
                let d2 = (dx * dx + dy * dy) as f32;
                spatial.push((-0.5 * d2 * inv_var).exp());
            }
        }

        let inv_srgb = 1.0 / params.bilateral_srgb;
        let features = image
            .pixels()
            .map(|p| p.0.map(|c| f32::from(c) * inv_srgb))
            .collect();

        Self {
            radius,
            spatial,
            features,
        }
    }

    fn filter(&self, input: &[f32], channels: usize, grid: Grid) -> Vec<f32> {
        let radius = self.radius;
        let side = 2 * radius + 1;
        let row_len = grid.width * channels;

        let mut output = vec![0.0_f32; input.len()];
        output
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, row)| {
                let y_lo = y.saturating_sub(radius);
                let y_hi = (y + radius).min(grid.height - 1);
                for x in 0..grid.width {
                    let center = self.features[y * grid.width + x];
                    let x_lo = x.saturating_sub(radius);
                    let x_hi = (x + radius).min(grid.width - 1);
                    let out = &mut row[x * channels..(x + 1) * channels];
                    for yy in y_lo..=y_hi {
                        let table = &self.spatial[(yy + radius - y) * side..][..side];
                        for xx in x_lo..=x_hi {
                            let j = yy * grid.width + xx;
                            let f = self.features[j];
                            let d0 = f[0] - center[0];
                            let d1 = f[1] - center[1];
                            let d2 = f[2] - center[2];
                            let color = (-0.5 * (d0 * d0 + d1 * d1 + d2 * d2)).exp();
                            let w = table[xx + radius - x] * color;
                            let sample = &input[j * channels..(j + 1) * channels];
                            for (o, &s) in out.iter_mut().zip(sample) {
                                *o = w.mul_add(s, *o);
                            }
                        }
                    }
                }
            });

        output
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::classes::LandCover;
    use crate::probability::softmax;
    use crate::refine::ArgmaxRefiner;
    use crate::types::Logits;

    /// Build a field where each pixel's distribution is chosen by `f`.
    fn field_from_fn(
        width: u32,
        height: u32,
        f: impl Fn(u32, u32) -> [f64; NUM_CLASSES],
    ) -> ProbabilityField {
        let pixels = (width * height) as usize;
        let mut data = vec![0.0; NUM_CLASSES * pixels];
        for y in 0..height {
            for x in 0..width {
                let i = (y * width + x) as usize;
                for (c, p) in f(x, y).into_iter().enumerate() {
                    data[c * pixels + i] = p;
                }
            }
        }
        ProbabilityField::new(width, height, data).unwrap()
    }

    fn two_class(a: LandCover, pa: f64, b: LandCover, pb: f64) -> [f64; NUM_CLASSES] {
        let mut pixel = [0.0; NUM_CLASSES];
        pixel[a.index()] = pa;
        pixel[b.index()] = pb;
        pixel
    }

    // --- parameters ---

    #[test]
    fn defaults_match_reference_settings() {
        let params = CrfParams::default();
        assert!((params.gaussian_sxy - 3.0).abs() < f32::EPSILON);
        assert!((params.gaussian_compat - 4.0).abs() < f32::EPSILON);
        assert!((params.bilateral_srgb - 20.0).abs() < f32::EPSILON);
        assert!((params.bilateral_compat - 5.0).abs() < f32::EPSILON);
        assert_eq!(params.iterations, 5);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_sigma() {
        let params = CrfParams {
            bilateral_srgb: 0.0,
            ..CrfParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(PipelineError::InvalidConfig(msg)) if msg.contains("bilateral_srgb")
        ));
    }

    #[test]
    fn validate_rejects_negative_compat() {
        let params = CrfParams {
            gaussian_compat: -1.0,
            ..CrfParams::default()
        };
        assert!(params.validate().is_err());
    }

    // --- filters ---

    #[test]
    fn gaussian_taps_are_symmetric_and_peak_at_center() {
        let taps = gaussian_taps(3.0, 3.0);
        assert_eq!(taps.len(), 19);
        assert!((taps[9] - 1.0).abs() < f32::EPSILON);
        for d in 0..9 {
            assert!((taps[d] - taps[18 - d]).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn separable_filter_of_ones_is_largest_in_the_interior() {
        let grid = Grid {
            width: 30,
            height: 30,
        };
        let taps = gaussian_taps(3.0, 3.0);
        let sums = separable_filter(&vec![1.0; grid.pixels()], 1, grid, &taps);
        let corner = sums[0];
        let center = sums[15 * 30 + 15];
        assert!(center > corner);
        // Interior sum approximates 2πσ².
        let expected = 2.0 * std::f32::consts::PI * 9.0;
        assert!((center - expected).abs() / expected < 0.01, "center = {center}");
    }

    #[test]
    fn argmax_prefers_first_index_on_ties() {
        let mut q = vec![0.0; NUM_CLASSES];
        q[2] = 0.5;
        q[6] = 0.5;
        assert_eq!(argmax_labels(&q), vec![2]);
    }

    // --- inference ---

    #[test]
    fn isolated_pixel_is_absorbed_by_surroundings() {
        let image = RgbImage::from_pixel(15, 15, image::Rgb([128, 128, 128]));
        let rest = 0.1 / 8.0;
        let field = field_from_fn(15, 15, |x, y| {
            if (x, y) == (7, 7) {
                two_class(LandCover::Rangeland, 0.55, LandCover::Tree, 0.45)
            } else {
                let mut pixel = [rest; NUM_CLASSES];
                pixel[LandCover::Tree.index()] = 0.9;
                pixel
            }
        });

        let before = ArgmaxRefiner.refine(&image, &field);
        assert_eq!(before.get(7, 7), LandCover::Rangeland);

        let labels = MeanFieldCrf::new(CrfParams::default()).refine(&image, &field);
        assert!(labels.as_raw().iter().all(|&id| id == LandCover::Tree.id()));
    }

    #[test]
    fn zero_compatibility_reduces_to_argmax() {
        let pixels = 6 * 5;
        #[allow(clippy::cast_precision_loss)]
        let data = (0..NUM_CLASSES * pixels)
            .map(|i| ((i * 37) % 23) as f32 * 0.7 - 6.0)
            .collect();
        let field = softmax(&Logits::new(NUM_CLASSES, 6, 5, data).unwrap()).unwrap();
        let image = RgbImage::from_fn(6, 5, |x, y| image::Rgb([(x * 40) as u8, (y * 50) as u8, 7]));

        let params = CrfParams {
            gaussian_compat: 0.0,
            bilateral_compat: 0.0,
            ..CrfParams::default()
        };
        let refined = MeanFieldCrf::new(params).refine(&image, &field);
        let argmax = ArgmaxRefiner.refine(&image, &field);
        assert_eq!(refined, argmax);
    }

    #[test]
    fn color_edge_is_respected() {
        let image = RgbImage::from_fn(20, 10, |x, _| {
            if x < 10 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        let field = field_from_fn(20, 10, |x, _| {
            if x < 10 {
                two_class(LandCover::Tree, 0.7, LandCover::Water, 0.3)
            } else {
                two_class(LandCover::Water, 0.7, LandCover::Tree, 0.3)
            }
        });

        let labels = MeanFieldCrf::new(CrfParams::default()).refine(&image, &field);
        for y in 0..10 {
            for x in 0..20 {
                let expected = if x < 10 {
                    LandCover::Tree
                } else {
                    LandCover::Water
                };
                assert_eq!(labels.get(x, y), expected, "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn output_preserves_shape_and_registry() {
        let pixels = 13 * 7;
        #[allow(clippy::cast_precision_loss)]
        let data = (0..NUM_CLASSES * pixels)
            .map(|i| ((i * 11) % 17) as f32 * 0.3)
            .collect();
        let field = softmax(&Logits::new(NUM_CLASSES, 13, 7, data).unwrap()).unwrap();
        let image = RgbImage::from_fn(13, 7, |x, y| image::Rgb([(x * 19) as u8, (y * 31) as u8, 90]));

        let labels = MeanFieldCrf::new(CrfParams::default()).refine(&image, &field);
        assert_eq!(labels.dimensions(), field.dimensions());
        assert!(labels.as_raw().iter().all(|&id| LandCover::from_id(id).is_some()));
    }

    #[test]
    fn single_pixel_image_keeps_its_argmax() {
        let image = RgbImage::from_pixel(1, 1, image::Rgb([10, 20, 30]));
        let field = field_from_fn(1, 1, |_, _| {
            two_class(LandCover::Building, 0.6, LandCover::Road, 0.4)
        });
        let labels = MeanFieldCrf::new(CrfParams::default()).refine(&image, &field);
        assert_eq!(labels.get(0, 0), LandCover::Building);
    }

    #[test]
    fn zero_iterations_is_argmax_of_unaries() {
        let image = RgbImage::from_pixel(3, 3, image::Rgb([0, 0, 0]));
        let field = field_from_fn(3, 3, |x, _| {
            if x == 1 {
                two_class(LandCover::Water, 0.8, LandCover::Tree, 0.2)
            } else {
                two_class(LandCover::Tree, 0.8, LandCover::Water, 0.2)
            }
        });
        let params = CrfParams {
            iterations: 0,
            ..CrfParams::default()
        };
        let labels = MeanFieldCrf::new(params).refine(&image, &field);
        assert_eq!(labels.get(1, 1), LandCover::Water);
        assert_eq!(labels.get(0, 1), LandCover::Tree);
    }
}
