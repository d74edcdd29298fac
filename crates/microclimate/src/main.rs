//! microclimate: command-line front end for dataset enrichment.
//!
//! Segments a dataset's images into land-cover fractions and merges them,
//! together with yearly climate from the weather archive, into the
//! dataset's `metadata.json`.
//!
//! # Usage
//!
//! ```text
//! microclimate [--data-dir <DIR>] list
//! microclimate [--data-dir <DIR>] segment <DATASET> --model <ONNX> [OPTIONS]
//! microclimate [--data-dir <DIR>] climate <DATASET>
//! microclimate [--data-dir <DIR>] summary <DATASET>
//! ```
//!
//! Logging goes to stderr and is filtered by `RUST_LOG` (default `info`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use microclimate_io::dataset::DEFAULT_BASE_DIR;
use microclimate_io::{
    ClimateAggregator, ClimateVariables, Dataset, DatasetCatalog, ImageEntry, OpenMeteoArchive,
    climate_dataset,
};
use microclimate_pipeline::{ConfidenceBoost, LandCover, PipelineConfig, RefinerKind};

/// Land-cover segmentation and climate aggregation for image datasets.
#[derive(Parser)]
#[command(name = "microclimate", version)]
struct Cli {
    /// Directory holding the dataset folders.
    #[arg(long, global = true, default_value = DEFAULT_BASE_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the datasets under the data directory.
    List,
    /// Segment every image of a dataset and record class fractions.
    ///
    /// Needs the ONNX Runtime backend: builds without the `onnx` feature
    /// report an error and exit with failure.
    #[command(after_help = SEGMENT_FEATURE_NOTE)]
    Segment(SegmentArgs),
    /// Aggregate yearly climate for a dataset's capture years.
    Climate {
        /// Dataset folder name.
        dataset: String,

        /// Override the weather archive endpoint.
        #[arg(long, default_value = OpenMeteoArchive::DEFAULT_BASE_URL)]
        archive_url: String,
    },
    /// Print a dataset's recorded metadata.
    Summary {
        /// Dataset folder name.
        dataset: String,
    },
}

#[derive(Args)]
struct SegmentArgs {
    /// Dataset folder name.
    dataset: String,

    /// Path to the exported segmentation network (.onnx).
    #[arg(long)]
    model: PathBuf,

    /// Network input edge length in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_INPUT_SIZE, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    input_size: u32,

    /// Refinement backend.
    #[arg(long, value_enum, default_value_t = CLI_DEFAULT_REFINER)]
    refiner: Refiner,

    /// Mean-field iterations of the dense CRF.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_ITERATIONS)]
    iterations: u32,

    /// Boost road and building confidence before refinement.
    #[arg(long)]
    boost_thin_structures: bool,

    /// Print per-image diagnostics as JSON instead of a report.
    #[arg(long)]
    json: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,
}

/// Refinement backend selection.
#[derive(Clone, Copy, ValueEnum)]
enum Refiner {
    /// Fully-connected CRF with mean-field inference.
    DenseCrf,
    /// Per-pixel arg-max of the network's probabilities.
    Argmax,
}

const fn refiner_from_pipeline(kind: RefinerKind) -> Refiner {
    match kind {
        RefinerKind::DenseCrf => Refiner::DenseCrf,
        RefinerKind::Argmax => Refiner::Argmax,
    }
}

#[cfg(feature = "onnx")]
const SEGMENT_FEATURE_NOTE: &str = "This build includes the ONNX Runtime backend.";

#[cfg(not(feature = "onnx"))]
const SEGMENT_FEATURE_NOTE: &str =
    "This build has no ONNX backend; `segment` always fails. Rebuild with `--features onnx`.";

const CLI_DEFAULT_REFINER: Refiner = refiner_from_pipeline(PipelineConfig::DEFAULT_REFINER);

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_args(args: &SegmentArgs) -> Result<PipelineConfig, String> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    let mut config = PipelineConfig {
        refiner: match args.refiner {
            Refiner::DenseCrf => RefinerKind::DenseCrf,
            Refiner::Argmax => RefinerKind::Argmax,
        },
        boost: if args.boost_thin_structures {
            ConfidenceBoost::thin_structures()
        } else {
            ConfidenceBoost::none()
        },
        ..PipelineConfig::default()
    };
    config.preprocess.size = args.input_size;
    config.crf.iterations = args.iterations;
    Ok(config)
}

fn open_dataset(catalog: &DatasetCatalog, name: &str) -> Result<Dataset, ExitCode> {
    catalog.dataset(name).map_err(|e| {
        eprintln!("{e}");
        ExitCode::FAILURE
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let catalog = DatasetCatalog::new(&cli.data_dir);

    let result = match cli.command {
        Command::List => list(&catalog),
        Command::Segment(ref args) => open_dataset(&catalog, &args.dataset).map(|d| segment(args, &d)),
        Command::Climate {
            ref dataset,
            ref archive_url,
        } => open_dataset(&catalog, dataset).map(|d| climate(&d, archive_url)),
        Command::Summary { ref dataset } => open_dataset(&catalog, dataset).map(|d| summary(&d)),
    };
    result.unwrap_or_else(|code| code)
}

fn list(catalog: &DatasetCatalog) -> Result<ExitCode, ExitCode> {
    let names = catalog.datasets().map_err(|e| {
        eprintln!("{e}");
        ExitCode::FAILURE
    })?;
    if names.is_empty() {
        eprintln!("No datasets under {}", catalog.base().display());
    }
    for name in names {
        println!("{name}");
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(feature = "onnx")]
fn segment(args: &SegmentArgs, dataset: &Dataset) -> ExitCode {
    let config = match config_from_args(args) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let network = match microclimate_io::OnnxNetwork::from_file(&args.model) {
        Ok(network) => network,
        Err(e) => {
            eprintln!("Error loading {}: {e}", args.model.display());
            return ExitCode::FAILURE;
        }
    };
    let model = match microclimate_pipeline::SegmentationModel::new(network, config.preprocess.clone()) {
        Ok(model) => model,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    run_segmentation(&model, config, dataset, args.json)
}

#[cfg(not(feature = "onnx"))]
fn segment(args: &SegmentArgs, _dataset: &Dataset) -> ExitCode {
    if let Err(msg) = config_from_args(args) {
        eprintln!("{msg}");
        return ExitCode::FAILURE;
    }
    eprintln!(
        "Cannot load {}: this build has no ONNX backend (rebuild with --features onnx)",
        args.model.display()
    );
    ExitCode::FAILURE
}

#[cfg_attr(not(feature = "onnx"), allow(dead_code))]
fn run_segmentation<N: microclimate_pipeline::SegmentationNetwork>(
    model: &microclimate_pipeline::SegmentationModel<N>,
    config: PipelineConfig,
    dataset: &Dataset,
    json: bool,
) -> ExitCode {
    eprintln!("Dataset: {}", dataset.root().display());
    eprintln!("Config: {config:#?}");
    eprintln!();

    let orchestrator = match microclimate_io::PipelineOrchestrator::new(model, config) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let report = match orchestrator.segment_dataset(dataset, None) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Segmentation aborted: {e}");
            return ExitCode::FAILURE;
        }
    };

    for image in &report.segmented {
        if json {
            match serde_json::to_string_pretty(&image.diagnostics) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    eprintln!("Error serializing diagnostics: {e}");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            println!("{}\n{}\n", image.filename, image.diagnostics.report());
        }
    }
    for failed in &report.failed {
        eprintln!("Skipped {}: {}", failed.filename, failed.error);
    }
    for path in &report.overwritten {
        eprintln!("Overwritten: {} (images share a file stem)", path.display());
    }
    for filename in &report.merge.skipped_missing_year {
        eprintln!("No capture year for {filename}; fractions not recorded");
    }
    eprintln!(
        "{} segmented, {} failed, metadata {}",
        report.segmented.len(),
        report.failed.len(),
        if report.merge.written { "updated" } else { "unchanged" },
    );

    if report.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn climate(dataset: &Dataset, archive_url: &str) -> ExitCode {
    let archive = match OpenMeteoArchive::with_base_url(archive_url) {
        Ok(archive) => archive,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let aggregator = ClimateAggregator::new(archive, ClimateVariables::default());

    match climate_dataset(dataset, &aggregator) {
        Ok(report) => {
            for (year, record) in &report.years {
                let present = record.values().filter(|v| v.is_some()).count();
                println!("{year}: {present}/{} variables", record.len());
            }
            eprintln!(
                "{} images updated, metadata {}",
                report.merge.climate_updated.len(),
                if report.merge.written { "updated" } else { "unchanged" },
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Climate aggregation aborted: {e}");
            ExitCode::FAILURE
        }
    }
}

fn summary(dataset: &Dataset) -> ExitCode {
    let metadata = match dataset.metadata_store().load() {
        Ok(metadata) => metadata,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Dataset: {}", dataset.name());
    match metadata.coordinates.as_ref().and_then(|c| c.lat_lon()) {
        Some((lat, lon)) => println!("Coordinates: {lat}, {lon}"),
        None => println!("Coordinates: not set"),
    }
    println!("{}", "-".repeat(60));

    for (filename, entry) in &metadata.images {
        println!("{filename} ({})", entry.year());
        let Some(record) = entry.record() else {
            continue;
        };
        if let Some(freq) = record.freq {
            for (class, fraction) in freq.iter() {
                println!("    {:<20} {:>6.2}%", class.name(), fraction * 100.0);
            }
        }
        if let Some(ref climate) = record.climate {
            let present = climate.values().filter(|v| v.is_some()).count();
            println!("    climate: {present}/{} variables", climate.len());
        }
    }

    let segmented = metadata
        .images
        .values()
        .filter_map(ImageEntry::record)
        .filter(|r| r.freq.is_some())
        .count();
    println!("{}", "-".repeat(60));
    println!(
        "{} images, {segmented} segmented, {} classes tracked",
        metadata.images.len(),
        LandCover::SUBSTANTIVE.len(),
    );
    ExitCode::SUCCESS
}
