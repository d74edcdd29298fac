//! microclimate-io: Filesystem and network side of microclimate.
//!
//! Lays out datasets on disk, owns each dataset's metadata document,
//! fetches yearly climate from the weather archive, and drives the
//! segmentation pipeline over a dataset's images. With the `onnx`
//! feature it also provides an ONNX Runtime segmentation network.

pub mod climate;
pub mod dataset;
pub mod metadata;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod orchestrator;

pub use climate::{
    ArchiveQuery, ClimateAggregator, ClimateArchive, ClimateError, ClimateRecord,
    ClimateVariables, Granularity, OpenMeteoArchive,
};
pub use dataset::{Dataset, DatasetCatalog, DatasetError};
pub use metadata::{
    Coordinates, DatasetMetadata, ImageEntry, ImageRecord, MergeReport, MetadataError,
    MetadataStore, MetadataUpdate,
};
#[cfg(feature = "onnx")]
pub use onnx::OnnxNetwork;
pub use orchestrator::{
    ClimateReport, ImageError, OrchestratorError, PipelineOrchestrator, SegmentationReport,
    StdClock, climate_dataset,
};
