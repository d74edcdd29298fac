//! Segmentation diagnostics: timing and counts for each stage.
//!
//! Every call to [`segment_with_diagnostics`] collects one
//! [`SegmentationDiagnostics`] alongside the segmentation itself. The
//! orchestrator logs them per image and the CLI can print them as a
//! report or as JSON.
//!
//! Time is read through the [`Clock`] trait so callers choose the time
//! source and tests can run without a real clock.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classes::LandCover;
use crate::frequency::ClassHistogram;
use crate::model::{SegmentationModel, SegmentationNetwork};
use crate::probability::{softmax, upsample_bilinear};
use crate::refine::{ArgmaxRefiner, DenseFieldRefiner, RefinerKind};
use crate::types::{Dimensions, PipelineConfig, PipelineError};
use crate::{Segmentation, decode_rgb};

/// Monotonic time source.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from segmenting one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationDiagnostics {
    /// Stage 0: image decoding.
    pub decode: StageDiagnostics,
    /// Stage 1: preprocessing, network forward pass, softmax, upsampling.
    pub inference: StageDiagnostics,
    /// Stage 2: confidence boost (only when biases are configured).
    pub boost: Option<StageDiagnostics>,
    /// Stage 3: label refinement.
    pub refinement: StageDiagnostics,
    /// Stage 4: class histogram and area fractions.
    pub statistics: StageDiagnostics,
    /// Total wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary across all stages.
    pub summary: SegmentationSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Image decoding metrics.
    Decode {
        /// Size of the input image bytes.
        input_bytes: usize,
        /// Decoded width in pixels.
        width: u32,
        /// Decoded height in pixels.
        height: u32,
        /// Total pixel count.
        pixel_count: u64,
    },
    /// Network inference metrics.
    Inference {
        /// Edge length of the square network input.
        input_size: u32,
        /// Width of the network's logit planes.
        output_width: u32,
        /// Height of the network's logit planes.
        output_height: u32,
        /// Logit channels reported by the network.
        classes: usize,
    },
    /// Confidence boost metrics.
    Boost {
        /// Number of class biases applied.
        biased_classes: usize,
        /// Sum of the configured biases.
        total_bias: f64,
    },
    /// Refinement metrics.
    Refinement {
        /// Which refiner ran.
        refiner: String,
        /// Mean-field iterations (zero for argmax).
        iterations: u32,
        /// Pixels whose label differs from the per-pixel argmax.
        relabeled_pixels: u64,
    },
    /// Statistics metrics.
    Statistics {
        /// Pixels labeled background.
        background_pixels: u64,
        /// Substantive class covering the most pixels, if any.
        dominant_class: Option<LandCover>,
    },
}

/// High-level summary for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationSummary {
    /// Source image width in pixels.
    pub image_width: u32,
    /// Source image height in pixels.
    pub image_height: u32,
    /// Total pixel count.
    pub pixel_count: u64,
    /// Sum of the substantive area fractions.
    pub labeled_fraction: f64,
}

impl SegmentationDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Segmentation Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.image_width, self.summary.image_height, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        let mut stages = vec![("Decode", &self.decode), ("Inference", &self.inference)];
        if let Some(ref boost) = self.boost {
            stages.push(("Boost", boost));
        }
        stages.push(("Refinement", &self.refinement));
        stages.push(("Statistics", &self.statistics));

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Labeled (non-background) fraction: {:.2}%",
            self.summary.labeled_fraction * 100.0,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Decode {
            input_bytes,
            width,
            height,
            ..
        } => format!("{input_bytes} bytes -> {width}x{height}"),
        StageMetrics::Inference {
            input_size,
            output_width,
            output_height,
            classes,
        } => format!("{input_size}x{input_size} -> {classes} x {output_width}x{output_height}"),
        StageMetrics::Boost {
            biased_classes,
            total_bias,
        } => format!("{biased_classes} classes, +{total_bias:.3}"),
        StageMetrics::Refinement {
            refiner,
            iterations,
            relabeled_pixels,
        } => format!("{refiner} iters={iterations} relabeled={relabeled_pixels}"),
        StageMetrics::Statistics {
            background_pixels,
            dominant_class,
        } => {
            let dominant = dominant_class.map_or_else(|| "none".to_string(), |c| c.to_string());
            format!("background={background_pixels} dominant={dominant}")
        }
    }
}

/// Segment encoded image bytes, timing every stage.
///
/// Produces the same [`Segmentation`] as [`segment`](crate::segment),
/// plus the per-stage diagnostics.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] or [`PipelineError::ImageDecode`]
/// for unreadable input, [`PipelineError::InvalidConfig`] for an invalid
/// configuration, and propagates network failures.
pub fn segment_with_diagnostics<N: SegmentationNetwork, C: Clock>(
    image_bytes: &[u8],
    model: &SegmentationModel<N>,
    config: &PipelineConfig,
    clock: &C,
) -> Result<(Segmentation, SegmentationDiagnostics), PipelineError> {
    config.validate()?;
    let total_start = clock.now();

    // 0. Decode.
    let start = clock.now();
    let image = decode_rgb(image_bytes)?;
    let dimensions = Dimensions::of(&image);
    let decode = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Decode {
            input_bytes: image_bytes.len(),
            width: dimensions.width,
            height: dimensions.height,
            pixel_count: dimensions.pixel_count() as u64,
        },
    };
    if dimensions.pixel_count() == 0 {
        return Err(PipelineError::EmptyField {
            width: dimensions.width,
            height: dimensions.height,
        });
    }

    // 1. Inference.
    let start = clock.now();
    let logits = model.logits(&image)?;
    let probabilities = upsample_bilinear(&softmax(&logits)?, dimensions);
    let inference = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Inference {
            input_size: model.preprocessor().config().size,
            output_width: logits.dimensions().width,
            output_height: logits.dimensions().height,
            classes: logits.classes(),
        },
    };

    // 2. Optional confidence boost.
    let (probabilities, boost) = if config.boost.is_empty() {
        (probabilities, None)
    } else {
        let start = clock.now();
        let boosted = config.boost.apply(probabilities);
        let diag = StageDiagnostics {
            duration: clock.elapsed(&start),
            metrics: StageMetrics::Boost {
                biased_classes: config.boost.biases().len(),
                total_bias: config.boost.biases().iter().map(|b| b.bias).sum(),
            },
        };
        (boosted, Some(diag))
    };

    // 3. Refinement.
    let start = clock.now();
    let labels = config.refiner.build(&config.crf).refine(&image, &probabilities);
    let refine_duration = clock.elapsed(&start);
    let argmax = ArgmaxRefiner.refine(&image, &probabilities);
    let relabeled_pixels = labels
        .as_raw()
        .iter()
        .zip(argmax.as_raw())
        .filter(|(a, b)| a != b)
        .count() as u64;
    let refinement = StageDiagnostics {
        duration: refine_duration,
        metrics: StageMetrics::Refinement {
            refiner: config.refiner.to_string(),
            iterations: match config.refiner {
                RefinerKind::DenseCrf => config.crf.iterations,
                RefinerKind::Argmax => 0,
            },
            relabeled_pixels,
        },
    };

    // 4. Statistics.
    let start = clock.now();
    let histogram = ClassHistogram::from_label_map(&labels);
    let frequencies = histogram.frequencies();
    let dominant_class = LandCover::SUBSTANTIVE
        .into_iter()
        .filter(|&c| histogram.count(c) > 0)
        .max_by_key(|&c| (histogram.count(c), std::cmp::Reverse(c)));
    let statistics = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Statistics {
            background_pixels: histogram.count(LandCover::Background),
            dominant_class,
        },
    };

    let diagnostics = SegmentationDiagnostics {
        decode,
        inference,
        boost,
        refinement,
        statistics,
        total_duration: clock.elapsed(&total_start),
        summary: SegmentationSummary {
            image_width: dimensions.width,
            image_height: dimensions.height,
            pixel_count: histogram.total(),
            labeled_fraction: frequencies.iter().map(|(_, f)| f).sum(),
        },
    };

    Ok((
        Segmentation {
            labels,
            frequencies,
        },
        diagnostics,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::classes::NUM_CLASSES;
    use crate::model::{InputTensor, PreprocessConfig};
    use crate::probability::ConfidenceBoost;
    use crate::types::Logits;

    /// Advances one millisecond on every reading.
    struct StepClock(Cell<u64>);

    impl Clock for StepClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.now() - since)
        }
    }

    /// Scores Road everywhere at a 2x2 output resolution.
    struct AllRoad;

    impl SegmentationNetwork for AllRoad {
        fn forward(&self, _input: &InputTensor) -> Result<Logits, PipelineError> {
            let mut data = vec![0.0; NUM_CLASSES * 4];
            for i in 0..4 {
                data[LandCover::Road.index() * 4 + i] = 5.0;
            }
            Logits::new(NUM_CLASSES, 2, 2, data)
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([90, 90, 90]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn model() -> SegmentationModel<AllRoad> {
        let config = PreprocessConfig {
            size: 8,
            ..PreprocessConfig::default()
        };
        SegmentationModel::new(AllRoad, config).unwrap()
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        assert!((duration_ms(d) - 1234.0).abs() < 0.01);
    }

    #[test]
    fn diagnostics_cover_every_stage() {
        let clock = StepClock(Cell::new(0));
        let config = PipelineConfig {
            boost: ConfidenceBoost::thin_structures(),
            ..PipelineConfig::default()
        };
        let (segmentation, diag) =
            segment_with_diagnostics(&png_bytes(6, 4), &model(), &config, &clock).unwrap();

        assert_eq!(segmentation.frequencies.get(LandCover::Road), Some(1.0));
        assert!(diag.boost.is_some());
        assert_eq!(diag.summary.pixel_count, 24);
        assert!(diag.total_duration >= diag.refinement.duration);
        assert!(matches!(
            diag.statistics.metrics,
            StageMetrics::Statistics {
                background_pixels: 0,
                dominant_class: Some(LandCover::Road),
            }
        ));
        assert!(matches!(
            diag.inference.metrics,
            StageMetrics::Inference {
                input_size: 8,
                output_width: 2,
                output_height: 2,
                classes: 9,
            }
        ));
    }

    #[test]
    fn boost_stage_absent_by_default() {
        let clock = StepClock(Cell::new(0));
        let (_, diag) =
            segment_with_diagnostics(&png_bytes(3, 3), &model(), &PipelineConfig::default(), &clock)
                .unwrap();
        assert!(diag.boost.is_none());
    }

    #[test]
    fn empty_bytes_are_rejected() {
        let clock = StepClock(Cell::new(0));
        let result = segment_with_diagnostics(&[], &model(), &PipelineConfig::default(), &clock);
        assert!(matches!(result, Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn report_lists_stages() {
        let clock = StepClock(Cell::new(0));
        let (_, diag) =
            segment_with_diagnostics(&png_bytes(3, 3), &model(), &PipelineConfig::default(), &clock)
                .unwrap();
        let report = diag.report();
        assert!(report.contains("Segmentation Diagnostics Report"));
        assert!(report.contains("Refinement"));
        assert!(report.contains("dense-crf"));
        assert!(!report.contains("Boost"));
    }

    #[test]
    fn diagnostics_serialize_durations_as_seconds() {
        let clock = StepClock(Cell::new(0));
        let (_, diag) =
            segment_with_diagnostics(&png_bytes(2, 2), &model(), &PipelineConfig::default(), &clock)
                .unwrap();
        let json = serde_json::to_value(&diag).unwrap();
        assert!(json["total_duration"].is_f64());
        let back: SegmentationDiagnostics = serde_json::from_value(json).unwrap();
        let drift = back.total_duration.as_secs_f64() - diag.total_duration.as_secs_f64();
        assert!(drift.abs() < 1e-9);
    }
}
