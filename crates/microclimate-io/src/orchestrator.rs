//! Per-dataset drivers for the two enrichment stages.
//!
//! [`PipelineOrchestrator::segment_dataset`] runs every image of a
//! dataset through the segmentation pipeline, writes each rendered map,
//! and merges all frequencies into the metadata document in one write.
//! [`climate_dataset`] aggregates climate for the dataset's capture years
//! and merges it the same way.
//!
//! Both run to completion on the calling thread. A failing image is
//! logged and skipped; a missing or malformed metadata document aborts
//! before any image is processed.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use microclimate_export::ExportError;
use microclimate_pipeline::diagnostics::{Clock, SegmentationDiagnostics, segment_with_diagnostics};
use microclimate_pipeline::{
    ClassFrequencies, PipelineConfig, PipelineError, SegmentationModel, SegmentationNetwork,
};

use crate::climate::{ClimateAggregator, ClimateArchive, ClimateRecord};
use crate::dataset::{Dataset, DatasetError};
use crate::metadata::{MergeReport, MetadataError, MetadataUpdate};

/// Errors that abort a whole stage.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The images directory could not be listed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// The metadata document is missing, malformed, or could not be
    /// replaced.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// The pipeline configuration is invalid.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The metadata document has no usable site coordinates.
    #[error("no coordinates recorded in {}", .0.display())]
    MissingCoordinates(PathBuf),
}

/// Why one image was skipped.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// The image file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// Image path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Decoding, inference, or refinement failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The rendered map could not be encoded.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// The rendered map could not be written.
    #[error(transparent)]
    Write(#[from] DatasetError),
}

/// [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// One successfully segmented image.
#[derive(Debug, Clone)]
pub struct SegmentedImage {
    /// Image file name, the key in the metadata document.
    pub filename: String,
    /// Where the rendered map was written.
    pub segmentation_path: PathBuf,
    /// Unrounded area fractions.
    pub frequencies: ClassFrequencies,
    /// Per-stage timings and counts.
    pub diagnostics: SegmentationDiagnostics,
}

/// One skipped image.
#[derive(Debug)]
pub struct FailedImage {
    /// Image file name.
    pub filename: String,
    /// Why the image was skipped.
    pub error: ImageError,
}

/// Outcome of segmenting one dataset.
#[derive(Debug, Default)]
pub struct SegmentationReport {
    /// Images segmented and rendered, in processing order.
    pub segmented: Vec<SegmentedImage>,
    /// Images skipped because of an error.
    pub failed: Vec<FailedImage>,
    /// Images left unprocessed because cancellation was requested.
    pub not_started: usize,
    /// Rendered maps written more than once in this run, because two
    /// images share a file stem (`a.png` and `a.jpg`). The last image
    /// processed owns the map.
    pub overwritten: Vec<PathBuf>,
    /// Outcome of the final frequency merge.
    pub merge: MergeReport,
}

impl SegmentationReport {
    /// Whether the run stopped early on request.
    #[must_use]
    pub const fn cancelled(&self) -> bool {
        self.not_started > 0
    }
}

/// Drives the segmentation stage with one explicitly owned model.
#[derive(Debug)]
pub struct PipelineOrchestrator<'m, N> {
    model: &'m SegmentationModel<N>,
    config: PipelineConfig,
}

impl<'m, N: SegmentationNetwork> PipelineOrchestrator<'m, N> {
    /// Segment with `model` under `config`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Pipeline`] if `config` is invalid.
    pub fn new(model: &'m SegmentationModel<N>, config: PipelineConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self { model, config })
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Segment every image of `dataset` and merge the frequencies.
    ///
    /// `cancel` is polled between images; an image already in progress
    /// always finishes, and the images completed so far are still merged.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Metadata`] if the metadata document is
    /// missing or malformed (checked before any image is processed, and
    /// again at merge time), and [`OrchestratorError::Dataset`] if the
    /// images directory cannot be listed.
    pub fn segment_dataset(
        &self,
        dataset: &Dataset,
        cancel: Option<&AtomicBool>,
    ) -> Result<SegmentationReport, OrchestratorError> {
        let store = dataset.metadata_store();
        store.load()?;

        let images = dataset.image_paths()?;
        log::info!(
            "segmenting {} images in dataset '{}'",
            images.len(),
            dataset.name()
        );

        let mut report = SegmentationReport::default();
        let mut written = HashSet::new();
        for (index, path) in images.iter().enumerate() {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                report.not_started = images.len() - index;
                log::info!("cancelled with {} images not started", report.not_started);
                break;
            }

            let filename = file_name(path);
            match self.segment_image(dataset, path, &filename) {
                Ok(segmented) => {
                    log::debug!("{filename}\n{}", segmented.diagnostics.report());
                    if !written.insert(segmented.segmentation_path.clone()) {
                        log::warn!(
                            "{} overwritten by {filename}: another image has the same stem",
                            segmented.segmentation_path.display(),
                        );
                        report.overwritten.push(segmented.segmentation_path.clone());
                    }
                    report.segmented.push(segmented);
                }
                Err(error) => {
                    log::error!("skipping {filename}: {error}");
                    report.failed.push(FailedImage { filename, error });
                }
            }
        }

        let updates: Vec<MetadataUpdate> = report
            .segmented
            .iter()
            .map(|image| MetadataUpdate::Frequencies {
                filename: image.filename.clone(),
                frequencies: image.frequencies,
            })
            .collect();
        report.merge = store.merge(&updates)?;

        log::info!(
            "dataset '{}': {} segmented, {} failed, {} frequencies recorded",
            dataset.name(),
            report.segmented.len(),
            report.failed.len(),
            report.merge.frequencies_written.len(),
        );
        Ok(report)
    }

    fn segment_image(
        &self,
        dataset: &Dataset,
        path: &Path,
        filename: &str,
    ) -> Result<SegmentedImage, ImageError> {
        let bytes = std::fs::read(path).map_err(|source| ImageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let (segmentation, diagnostics) =
            segment_with_diagnostics(&bytes, self.model, &self.config, &StdClock)?;
        let png = microclimate_export::render_png(&segmentation.labels)?;
        let segmentation_path = dataset.write_segmentation(path, &png)?;

        Ok(SegmentedImage {
            filename: filename.to_string(),
            segmentation_path,
            frequencies: segmentation.frequencies,
            diagnostics,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Outcome of the climate stage for one dataset.
#[derive(Debug, Default)]
pub struct ClimateReport {
    /// Aggregated climate per capture year, unrounded.
    pub years: BTreeMap<i32, ClimateRecord>,
    /// Outcome of the climate merge.
    pub merge: MergeReport,
}

/// Aggregate climate for every capture year of `dataset` and merge it.
///
/// # Errors
///
/// Returns [`OrchestratorError::Metadata`] if the metadata document is
/// missing or malformed, and [`OrchestratorError::MissingCoordinates`] if
/// it records no latitude or longitude. Archive failures never surface
/// here; they degrade to `null` values for the affected year.
pub fn climate_dataset<A: ClimateArchive>(
    dataset: &Dataset,
    aggregator: &ClimateAggregator<A>,
) -> Result<ClimateReport, OrchestratorError> {
    let store = dataset.metadata_store();
    let metadata = store.load()?;
    let (latitude, longitude) = metadata
        .coordinates
        .as_ref()
        .and_then(crate::metadata::Coordinates::lat_lon)
        .ok_or_else(|| OrchestratorError::MissingCoordinates(store.path().to_path_buf()))?;

    let years = metadata.years();
    log::info!(
        "aggregating climate for {} years at ({latitude}, {longitude}) in dataset '{}'",
        years.len(),
        dataset.name(),
    );
    let aggregated = aggregator.aggregate(latitude, longitude, &years);

    let updates: Vec<MetadataUpdate> = aggregated
        .iter()
        .map(|(&year, values)| MetadataUpdate::Climate {
            year,
            values: values.clone(),
        })
        .collect();
    let merge = store.merge(&updates)?;

    Ok(ClimateReport {
        years: aggregated,
        merge,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_clock_is_monotonic() {
        let clock = StdClock;
        let start = clock.now();
        assert!(clock.elapsed(&start) < Duration::from_secs(60));
    }

    #[test]
    fn report_without_pending_images_is_not_cancelled() {
        let report = SegmentationReport::default();
        assert!(!report.cancelled());
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(file_name(Path::new("/data/site/images/a.png")), "a.png");
    }
}
