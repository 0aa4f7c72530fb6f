use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClimateError;

/// Axis-aligned rectangle in lon/lat, ordered min-lon, min-lat, max-lon, max-lat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self, ClimateError> {
        Self::from_values(&[min_lon, min_lat, max_lon, max_lat])
    }

    pub fn from_values(values: &[f64]) -> Result<Self, ClimateError> {
        let [min_lon, min_lat, max_lon, max_lat] = values else {
            return Err(ClimateError::InvalidBbox(format!(
                "expected 4 components, got {}",
                values.len()
            )));
        };
        if values.iter().any(|value| !value.is_finite()) {
            return Err(ClimateError::InvalidBbox(format!(
                "non-finite component in {values:?}"
            )));
        }
        if min_lon > max_lon || min_lat > max_lat {
            return Err(ClimateError::InvalidBbox(format!(
                "min must not exceed max on either axis: {values:?}"
            )));
        }
        Ok(Self {
            min_lon: *min_lon,
            min_lat: *min_lat,
            max_lon: *max_lon,
            max_lat: *max_lat,
        })
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl FromStr for BoundingBox {
    type Err = ClimateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let values = value
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|_| ClimateError::InvalidBbox(value.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_values(&values)
    }
}

/// Inclusive time window, both ends at second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    /// Interval notation accepted by STAC `datetime` filters.
    pub fn to_interval(&self) -> String {
        format!(
            "{}/{}",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Ordered collection identifiers; order only affects catalog query precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collections(Vec<String>);

impl Collections {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|value| value == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Collections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// Catalog filter predicate in STAC query-extension form, e.g. `{"era5:kind": {"eq": "fc"}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Predicate(Map<String, Value>);

impl Predicate {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReturnFormat {
    #[default]
    Grid,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
    Netcdf,
}

impl OutputFormat {
    pub fn from_path(path: &Utf8Path) -> Result<Self, ClimateError> {
        match path.extension().map(|ext| ext.to_ascii_lowercase()).as_deref() {
            Some("csv") => Ok(OutputFormat::Csv),
            Some("json") => Ok(OutputFormat::Json),
            Some("nc") => Ok(OutputFormat::Netcdf),
            _ => Err(ClimateError::InvalidOutputFormat(path.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Netcdf => write!(f, "netcdf"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    TimeConcat,
    ModelStack,
    OuterMerge,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::TimeConcat => write!(f, "time-concat"),
            MergeStrategy::ModelStack => write!(f, "model-stack"),
            MergeStrategy::OuterMerge => write!(f, "outer-merge"),
        }
    }
}

/// Per-item retrieval specialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchShape {
    Item,
    Model,
    Forecast,
    ArchiveFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CatalogKind {
    Reanalysis,
    Ensemble,
    SeasonalForecast,
}

impl CatalogKind {
    pub fn select(
        repository: &Repository,
        collections: &Collections,
        forecast_repository: &str,
        ensemble_collections: &[String],
    ) -> Self {
        if repository.name == forecast_repository {
            CatalogKind::SeasonalForecast
        } else if ensemble_collections
            .iter()
            .any(|name| collections.contains(name))
        {
            CatalogKind::Ensemble
        } else {
            CatalogKind::Reanalysis
        }
    }

    pub fn strategy(self) -> MergeStrategy {
        match self {
            CatalogKind::Reanalysis => MergeStrategy::TimeConcat,
            CatalogKind::Ensemble => MergeStrategy::ModelStack,
            CatalogKind::SeasonalForecast => MergeStrategy::OuterMerge,
        }
    }

    pub fn fetch_shape(self) -> FetchShape {
        match self {
            CatalogKind::Reanalysis => FetchShape::Item,
            CatalogKind::Ensemble => FetchShape::Model,
            CatalogKind::SeasonalForecast => FetchShape::Forecast,
        }
    }

    /// Ensemble searches are not time-filtered; time selection happens after the model merge.
    pub fn filters_time_in_search(self) -> bool {
        !matches!(self, CatalogKind::Ensemble)
    }
}
