//! The per-dataset metadata document and its merge operations.
//!
//! A dataset's `metadata.json` is written once by the capture phase
//! (coordinates plus one year per image) and then enriched by later
//! stages: segmentation adds `freq` per image, climate aggregation adds
//! `climate` per image. [`MetadataStore`] is the only writer.
//!
//! # Merge discipline
//!
//! Every [`MetadataStore::merge`] reads and parses the whole document,
//! applies all updates in memory, and replaces the file in one atomic
//! rename. A malformed document aborts the merge before anything is
//! written; a merge that changes nothing writes nothing. There is no
//! locking: two processes merging into the same dataset concurrently
//! race, and the last writer wins.
//!
//! # Document shape
//!
//! ```text
//! {
//!     "coordinates": {"latitude": 31.98, "longitude": 34.82},
//!     "images": {
//!         "a.png": 2019,
//!         "b.png": {"year": 2020, "freq": [...], "climate": {...}}
//!     }
//! }
//! ```
//!
//! An image entry is either a bare year (written at capture) or a full
//! record. Merging into a bare year upgrades it to a record carrying
//! that year. Fields this crate does not model are preserved as-is.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use microclimate_pipeline::ClassFrequencies;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::climate::ClimateRecord;

/// Decimal places kept for area fractions.
pub const FREQUENCY_DECIMALS: i32 = 2;

/// Decimal places kept for climate values.
pub const CLIMATE_DECIMALS: i32 = 4;

/// Errors that can occur while reading or writing a metadata document.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The document does not exist yet.
    #[error("metadata document not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Reading or replacing the document failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Document path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The existing document is not valid metadata JSON.
    #[error("malformed metadata document {}: {source}", path.display())]
    Malformed {
        /// Document path.
        path: PathBuf,
        /// Parse error, with line and column.
        source: serde_json::Error,
    },

    /// The document could not be serialized.
    #[error("failed to encode metadata: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The whole metadata document of one dataset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Site location, if the capture phase recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,

    /// Per-image entries, keyed by file name.
    #[serde(default)]
    pub images: BTreeMap<String, ImageEntry>,

    /// Top-level fields this crate does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Site coordinates in degrees.
///
/// Parsing is lenient about what the capture phase wrote: numeric
/// strings are parsed, an absent field becomes `0.0`, and an explicit
/// `null` (location not yet chosen) stays `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude, or `None` if not yet chosen.
    #[serde(default = "zero_coordinate", deserialize_with = "lenient_coordinate")]
    pub latitude: Option<f64>,

    /// Longitude, or `None` if not yet chosen.
    #[serde(default = "zero_coordinate", deserialize_with = "lenient_coordinate")]
    pub longitude: Option<f64>,

    /// Fields this crate does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Coordinates {
    /// Both coordinates, if both are known.
    #[must_use]
    pub const fn lat_lon(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
const fn zero_coordinate() -> Option<f64> {
    Some(0.0)
}

fn lenient_coordinate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("coordinate is not representable as f64")),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("coordinate {s:?} is not a number: {e}"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "coordinate must be a number or numeric string, got {other}"
        ))),
    }
}

/// One image's entry: a bare capture year or a full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageEntry {
    /// Only the capture year is known.
    Year(i32),
    /// Capture year plus any derived fields.
    Record(ImageRecord),
}

impl ImageEntry {
    /// The capture year.
    #[must_use]
    pub const fn year(&self) -> i32 {
        match self {
            Self::Year(year) => *year,
            Self::Record(record) => record.year,
        }
    }

    /// Modify the full record, first upgrading a bare year to a record
    /// carrying that year.
    pub fn update_record(&mut self, f: impl FnOnce(&mut ImageRecord)) {
        let mut record = match std::mem::replace(self, Self::Year(0)) {
            Self::Year(year) => ImageRecord::new(year),
            Self::Record(record) => record,
        };
        f(&mut record);
        *self = Self::Record(record);
    }

    /// The record, if this entry has been upgraded.
    #[must_use]
    pub const fn record(&self) -> Option<&ImageRecord> {
        match self {
            Self::Year(_) => None,
            Self::Record(record) => Some(record),
        }
    }
}

/// A full per-image record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Capture year; assigned at capture and never changed by merges.
    pub year: i32,

    /// Area fraction per substantive class, once segmented.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<ClassFrequencies>,

    /// Yearly climate means, once aggregated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub climate: Option<ClimateRecord>,

    /// Fields this crate does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageRecord {
    /// A record carrying only its year.
    #[must_use]
    pub fn new(year: i32) -> Self {
        Self {
            year,
            freq: None,
            climate: None,
            extra: Map::new(),
        }
    }
}

/// One partial change produced by a pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataUpdate {
    /// Set the area fractions of one image.
    Frequencies {
        /// Image file name (key in `images`).
        filename: String,
        /// Unrounded fractions.
        frequencies: ClassFrequencies,
    },
    /// Set the climate of every image captured in `year`.
    Climate {
        /// Capture year to match.
        year: i32,
        /// Unrounded yearly means.
        values: ClimateRecord,
    },
}

/// What a merge did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeReport {
    /// Images whose `freq` was set.
    pub frequencies_written: Vec<String>,
    /// Frequency updates dropped because the image has no entry (and so
    /// no known capture year).
    pub skipped_missing_year: Vec<String>,
    /// Images whose `climate` was set.
    pub climate_updated: Vec<String>,
    /// Whether the document on disk was replaced.
    pub written: bool,
}

impl DatasetMetadata {
    /// Apply one update in memory, recording the outcome in `report`.
    pub fn apply(&mut self, update: &MetadataUpdate, report: &mut MergeReport) {
        match update {
            MetadataUpdate::Frequencies {
                filename,
                frequencies,
            } => match self.images.get_mut(filename) {
                Some(entry) => {
                    let rounded = frequencies.rounded(FREQUENCY_DECIMALS);
                    entry.update_record(|record| record.freq = Some(rounded));
                    report.frequencies_written.push(filename.clone());
                }
                None => {
                    log::warn!("no capture year for image '{filename}', frequencies not recorded");
                    report.skipped_missing_year.push(filename.clone());
                }
            },
            MetadataUpdate::Climate { year, values } => {
                let rounded: ClimateRecord = values
                    .iter()
                    .map(|(name, value)| (name.clone(), value.map(round_climate)))
                    .collect();
                for (filename, entry) in &mut self.images {
                    if entry.year() == *year {
                        entry.update_record(|record| record.climate = Some(rounded.clone()));
                        report.climate_updated.push(filename.clone());
                    }
                }
            }
        }
    }

    /// Distinct capture years across all images.
    #[must_use]
    pub fn years(&self) -> std::collections::BTreeSet<i32> {
        self.images.values().map(ImageEntry::year).collect()
    }
}

fn round_climate(value: f64) -> f64 {
    microclimate_pipeline::frequency::round_to(value, CLIMATE_DECIMALS)
}

/// Reads and merges into one `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    /// A store for the document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the document exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read and parse the document.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::NotFound`] if the document does not exist,
    /// [`MetadataError::Io`] if it cannot be read, and
    /// [`MetadataError::Malformed`] if it does not parse.
    pub fn load(&self) -> Result<DatasetMetadata, MetadataError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MetadataError::NotFound(self.path.clone()));
            }
            Err(source) => {
                return Err(MetadataError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| MetadataError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Apply `updates` with one read and at most one write.
    ///
    /// # Errors
    ///
    /// Returns the [`load`](Self::load) errors without writing anything,
    /// and [`MetadataError::Io`] or [`MetadataError::Encode`] if the
    /// replacement cannot be written, in which case the previous document
    /// is left intact.
    pub fn merge(&self, updates: &[MetadataUpdate]) -> Result<MergeReport, MetadataError> {
        let original = self.load()?;
        let mut document = original.clone();
        let mut report = MergeReport::default();
        for update in updates {
            document.apply(update, &mut report);
        }

        if document != original {
            self.save(&document)?;
            report.written = true;
        }
        log::debug!(
            "merged {} updates into {} (written: {})",
            updates.len(),
            self.path.display(),
            report.written,
        );
        Ok(report)
    }

    /// Replace the document with `metadata`.
    ///
    /// Writes to a temporary file beside the document and renames it into
    /// place, so readers see either the old or the new document in full.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Encode`] if serialization fails and
    /// [`MetadataError::Io`] if writing or renaming fails.
    pub fn save(&self, metadata: &DatasetMetadata) -> Result<(), MetadataError> {
        let bytes = to_pretty_json(metadata)?;
        let io_err = |source| MetadataError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// Serialize with four-space indentation.
///
/// # Errors
///
/// Returns [`MetadataError::Encode`] if serialization fails.
pub fn to_pretty_json(metadata: &DatasetMetadata) -> Result<Vec<u8>, MetadataError> {
    let mut bytes = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    metadata
        .serialize(&mut serializer)
        .map_err(MetadataError::Encode)?;
    Ok(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(json: &str) -> DatasetMetadata {
        serde_json::from_str(json).unwrap()
    }

    fn freq(first: f64) -> ClassFrequencies {
        ClassFrequencies([first, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    // --- parsing ---

    #[test]
    fn bare_year_and_record_both_parse() {
        let doc = parse(r#"{"images": {"a.png": 2019, "b.png": {"year": 2020, "freq": [0,0,0,0,0,0,0,0.5]}}}"#);
        assert_eq!(doc.images["a.png"], ImageEntry::Year(2019));
        let b = doc.images["b.png"].record().unwrap();
        assert_eq!(b.year, 2020);
        assert_eq!(b.freq.unwrap()[7], 0.5);
        assert!(doc.coordinates.is_none());
    }

    #[test]
    fn coordinates_are_coerced() {
        let doc = parse(r#"{"coordinates": {"latitude": "31.98", "longitude": 34.5}, "images": {}}"#);
        let coords = doc.coordinates.unwrap();
        assert_eq!(coords.lat_lon(), Some((31.98, 34.5)));
    }

    #[test]
    fn absent_coordinate_defaults_to_zero() {
        let doc = parse(r#"{"coordinates": {"latitude": 12.0}, "images": {}}"#);
        let coords = doc.coordinates.unwrap();
        assert_eq!(coords.longitude, Some(0.0));
    }

    #[test]
    fn null_coordinates_stay_null() {
        let doc = parse(r#"{"coordinates": {"latitude": null, "longitude": null}, "images": {}}"#);
        let coords = doc.coordinates.as_ref().unwrap();
        assert_eq!(coords.latitude, None);
        assert_eq!(coords.lat_lon(), None);
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["coordinates"]["latitude"].is_null());
    }

    #[test]
    fn non_numeric_coordinate_is_malformed() {
        let result: Result<DatasetMetadata, _> =
            serde_json::from_str(r#"{"coordinates": {"latitude": "north", "longitude": 1}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = r#"{"images": {"a.png": {"year": 2019, "note": "cloudy"}}, "site": "orchard"}"#;
        let doc = parse(json);
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["site"], "orchard");
        assert_eq!(value["images"]["a.png"]["note"], "cloudy");
    }

    // --- frequency merge ---

    #[test]
    fn frequency_upgrades_bare_year() {
        let mut doc = parse(r#"{"images": {"a.png": 2019}}"#);
        let mut report = MergeReport::default();
        doc.apply(
            &MetadataUpdate::Frequencies {
                filename: "a.png".to_string(),
                frequencies: freq(0.1),
            },
            &mut report,
        );
        let record = doc.images["a.png"].record().unwrap();
        assert_eq!(record.year, 2019);
        assert_eq!(record.freq, Some(freq(0.1)));
        assert_eq!(report.frequencies_written, vec!["a.png"]);
    }

    #[test]
    fn frequency_is_rounded_to_two_places() {
        let mut doc = parse(r#"{"images": {"a.png": 2019}}"#);
        doc.apply(
            &MetadataUpdate::Frequencies {
                filename: "a.png".to_string(),
                frequencies: freq(0.123_456),
            },
            &mut MergeReport::default(),
        );
        assert_eq!(doc.images["a.png"].record().unwrap().freq, Some(freq(0.12)));
    }

    #[test]
    fn frequency_keeps_existing_climate() {
        let mut doc = parse(r#"{"images": {"a.png": {"year": 2019, "climate": {"t": 1.5}}}}"#);
        doc.apply(
            &MetadataUpdate::Frequencies {
                filename: "a.png".to_string(),
                frequencies: freq(0.3),
            },
            &mut MergeReport::default(),
        );
        let record = doc.images["a.png"].record().unwrap();
        assert_eq!(record.climate.as_ref().unwrap()["t"], Some(1.5));
        assert_eq!(record.freq, Some(freq(0.3)));
    }

    #[test]
    fn frequency_for_unknown_image_is_skipped() {
        let mut doc = parse(r#"{"images": {"a.png": 2019}}"#);
        let before = doc.clone();
        let mut report = MergeReport::default();
        doc.apply(
            &MetadataUpdate::Frequencies {
                filename: "ghost.png".to_string(),
                frequencies: freq(0.1),
            },
            &mut report,
        );
        assert_eq!(doc, before);
        assert_eq!(report.skipped_missing_year, vec!["ghost.png"]);
    }

    // --- climate merge ---

    #[test]
    fn climate_touches_only_matching_year() {
        let mut doc = parse(
            r#"{"images": {
                "a.png": 2020,
                "b.png": {"year": 2019, "climate": {"t": 9.0}},
                "c.png": {"year": 2020, "freq": [0,0,0,0,0,0,0,0]}
            }}"#,
        );
        let mut values = ClimateRecord::new();
        values.insert("t".to_string(), Some(21.123_456));
        values.insert("rh".to_string(), None);
        let mut report = MergeReport::default();
        doc.apply(&MetadataUpdate::Climate { year: 2020, values }, &mut report);

        assert_eq!(report.climate_updated, vec!["a.png", "c.png"]);
        let a = doc.images["a.png"].record().unwrap();
        assert_eq!(a.climate.as_ref().unwrap()["t"], Some(21.1235));
        assert_eq!(a.climate.as_ref().unwrap()["rh"], None);
        let b = doc.images["b.png"].record().unwrap();
        assert_eq!(b.climate.as_ref().unwrap()["t"], Some(9.0));
        let c = doc.images["c.png"].record().unwrap();
        assert!(c.freq.is_some());
        assert!(c.climate.is_some());
    }

    #[test]
    fn years_are_distinct() {
        let doc = parse(r#"{"images": {"a.png": 2020, "b.png": {"year": 2019}, "c.png": 2020}}"#);
        assert_eq!(doc.years().into_iter().collect::<Vec<_>>(), vec![2019, 2020]);
    }

    // --- serialization ---

    #[test]
    fn pretty_json_uses_four_spaces() {
        let doc = parse(r#"{"images": {"a.png": 2019}}"#);
        let text = String::from_utf8(to_pretty_json(&doc).unwrap()).unwrap();
        assert_eq!(text, "{\n    \"images\": {\n        \"a.png\": 2019\n    }\n}");
    }

    #[test]
    fn error_messages_name_the_path() {
        let err = MetadataError::NotFound(PathBuf::from("/data/site/metadata.json"));
        assert_eq!(
            err.to_string(),
            "metadata document not found: /data/site/metadata.json"
        );
    }
}
