//! Yearly climate aggregation from a historical weather archive.
//!
//! For each requested year the [`ClimateAggregator`] asks a
//! [`ClimateArchive`] for two parallel sample sets over the full calendar
//! year (one at daily, one at hourly granularity) and reduces every
//! variable to the mean of its non-null samples. The two sets are merged
//! into one flat [`ClimateRecord`] keyed by variable name.
//!
//! A year whose retrieval fails resolves to a record with every variable
//! `null`; the remaining years are still fetched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Aggregated climate for one year: variable name to mean, or `None`
/// when no sample was available.
pub type ClimateRecord = BTreeMap<String, Option<f64>>;

/// Raw samples per variable for one year, as returned by an archive.
pub type Samples = BTreeMap<String, Vec<Option<f64>>>;

/// Errors that can occur while talking to a climate archive.
#[derive(Debug, thiserror::Error)]
pub enum ClimateError {
    /// The HTTP request failed, timed out, or returned a non-success
    /// status.
    #[error("climate archive request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The archive could not serve the request for another reason.
    #[error("climate archive unavailable: {0}")]
    Unavailable(String),
}

/// Sampling granularity of an archive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// One sample per day.
    Daily,
    /// One sample per hour.
    Hourly,
}

impl Granularity {
    /// Query parameter and response block name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Hourly => "hourly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archive request: a set of variables for one site and year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveQuery<'a> {
    /// Site latitude in degrees.
    pub latitude: f64,
    /// Site longitude in degrees.
    pub longitude: f64,
    /// Calendar year; the request spans January 1 through December 31.
    pub year: i32,
    /// Sampling granularity.
    pub granularity: Granularity,
    /// Variable names to retrieve.
    pub variables: &'a [String],
}

/// A source of historical weather samples.
pub trait ClimateArchive {
    /// Retrieve samples for every requested variable. Variables the
    /// archive does not know may be absent from the result.
    ///
    /// # Errors
    ///
    /// Returns [`ClimateError`] on transport or service failure.
    fn fetch(&self, query: &ArchiveQuery<'_>) -> Result<Samples, ClimateError>;
}

impl<A: ClimateArchive + ?Sized> ClimateArchive for &A {
    fn fetch(&self, query: &ArchiveQuery<'_>) -> Result<Samples, ClimateError> {
        (**self).fetch(query)
    }
}

/// The daily and hourly variable sets to aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClimateVariables {
    /// Variables sampled once per day.
    pub daily: Vec<String>,
    /// Variables sampled once per hour.
    pub hourly: Vec<String>,
}

impl ClimateVariables {
    /// Default daily variables.
    pub const DEFAULT_DAILY: [&'static str; 5] = [
        "temperature_2m_max",
        "temperature_2m_min",
        "temperature_2m_mean",
        "wind_speed_10m_max",
        "wind_gusts_10m_max",
    ];

    /// Default hourly variables.
    pub const DEFAULT_HOURLY: [&'static str; 9] = [
        "relative_humidity_2m",
        "dew_point_2m",
        "surface_pressure",
        "vapour_pressure_deficit",
        "soil_temperature_100_to_255cm",
        "soil_moisture_100_to_255cm",
        "wet_bulb_temperature_2m",
        "total_column_integrated_water_vapour",
        "direct_radiation",
    ];

    /// Every variable name, daily first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.daily.iter().chain(&self.hourly).map(String::as_str)
    }

    /// A record with every variable set to `None`.
    #[must_use]
    pub fn null_record(&self) -> ClimateRecord {
        self.names().map(|name| (name.to_string(), None)).collect()
    }
}

impl Default for ClimateVariables {
    fn default() -> Self {
        Self {
            daily: Self::DEFAULT_DAILY.iter().map(ToString::to_string).collect(),
            hourly: Self::DEFAULT_HOURLY.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Mean of the non-null samples, or `None` if there are none.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_of_present(samples: &[Option<f64>]) -> Option<f64> {
    let (sum, count) = samples
        .iter()
        .flatten()
        .fold((0.0, 0_usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Reduces archive samples to yearly means.
#[derive(Debug)]
pub struct ClimateAggregator<A> {
    archive: A,
    variables: ClimateVariables,
}

impl<A: ClimateArchive> ClimateAggregator<A> {
    /// Aggregate the given variables from `archive`.
    pub const fn new(archive: A, variables: ClimateVariables) -> Self {
        Self { archive, variables }
    }

    /// The variable sets being aggregated.
    pub const fn variables(&self) -> &ClimateVariables {
        &self.variables
    }

    /// Yearly means for every year in `years`.
    ///
    /// Never fails: a year whose retrieval errors resolves to a record of
    /// all-`None` values and a warning is logged.
    pub fn aggregate(
        &self,
        latitude: f64,
        longitude: f64,
        years: &BTreeSet<i32>,
    ) -> BTreeMap<i32, ClimateRecord> {
        years
            .iter()
            .map(|&year| {
                let record = match self.aggregate_year(latitude, longitude, year) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("climate for {year} unavailable, recording nulls: {e}");
                        self.variables.null_record()
                    }
                };
                (year, record)
            })
            .collect()
    }

    /// Yearly means for one year.
    ///
    /// # Errors
    ///
    /// Propagates the first archive failure.
    pub fn aggregate_year(
        &self,
        latitude: f64,
        longitude: f64,
        year: i32,
    ) -> Result<ClimateRecord, ClimateError> {
        let mut record = ClimateRecord::new();
        for (granularity, variables) in [
            (Granularity::Daily, &self.variables.daily),
            (Granularity::Hourly, &self.variables.hourly),
        ] {
            if variables.is_empty() {
                continue;
            }
            let query = ArchiveQuery {
                latitude,
                longitude,
                year,
                granularity,
                variables,
            };
            let samples = self.archive.fetch(&query)?;
            for name in variables {
                let mean = samples.get(name).and_then(|s| mean_of_present(s));
                record.insert(name.clone(), mean);
            }
        }
        log::debug!("aggregated {} climate variables for {year}", record.len());
        Ok(record)
    }
}

/// Open-Meteo historical weather archive over blocking HTTP.
#[derive(Debug, Clone)]
pub struct OpenMeteoArchive {
    client: reqwest::blocking::Client,
    base_url: String,
}

/// Archive response: one optional block per granularity, each a map of
/// variable name to sample array (plus a `time` array).
#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    #[serde(default)]
    daily: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    hourly: BTreeMap<String, serde_json::Value>,
}

impl OpenMeteoArchive {
    /// Public archive endpoint.
    pub const DEFAULT_BASE_URL: &'static str = "https://archive-api.open-meteo.com/v1/archive";

    /// Per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Client for the public endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ClimateError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn new() -> Result<Self, ClimateError> {
        Self::with_base_url(Self::DEFAULT_BASE_URL)
    }

    /// Client for an alternative endpoint with the same API.
    ///
    /// # Errors
    ///
    /// Returns [`ClimateError::Transport`] if the HTTP client cannot be
    /// built.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ClimateError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .user_agent(concat!("microclimate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// The endpoint requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ClimateArchive for OpenMeteoArchive {
    fn fetch(&self, query: &ArchiveQuery<'_>) -> Result<Samples, ClimateError> {
        let params = [
            ("latitude", query.latitude.to_string()),
            ("longitude", query.longitude.to_string()),
            ("start_date", format!("{}-01-01", query.year)),
            ("end_date", format!("{}-12-31", query.year)),
            (query.granularity.as_str(), query.variables.join(",")),
            ("timezone", "auto".to_string()),
        ];
        let response: ArchiveResponse = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()?
            .error_for_status()?
            .json()?;

        let mut block = match query.granularity {
            Granularity::Daily => response.daily,
            Granularity::Hourly => response.hourly,
        };
        Ok(query
            .variables
            .iter()
            .filter_map(|name| {
                let values = block.remove(name)?;
                Some((name.clone(), samples_from_json(&values)))
            })
            .collect())
    }
}

/// Read a JSON array as samples; non-numeric entries count as missing.
fn samples_from_json(value: &serde_json::Value) -> Vec<Option<f64>> {
    value
        .as_array()
        .map(|items| items.iter().map(serde_json::Value::as_f64).collect())
        .unwrap_or_default()
}
