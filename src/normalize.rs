//! Validation and canonicalisation of user-facing request parameters.
//!
//! Everything here is pure: no network and no filesystem access. Parameter
//! errors surface before any fetch is attempted.

use camino::Utf8PathBuf;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::Config;
use crate::domain::{
    BoundingBox, CatalogKind, Collections, OutputFormat, Predicate, Repository, ReturnFormat,
    TimeRange,
};
use crate::error::ClimateError;

pub const DATE_FORMAT: &str = "%d-%m-%Y";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BboxInput {
    Values(Vec<f64>),
    Parts(Vec<String>),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CollectionsInput {
    List(Vec<String>),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueryInput {
    Structured(Map<String, Value>),
    Text(String),
}

/// Request parameters as a caller supplies them.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub variable: String,
    pub factor: f64,
    pub bbox: BboxInput,
    pub start_date: String,
    pub end_date: String,
    pub repository: String,
    pub collections: CollectionsInput,
    pub query: QueryInput,
    pub models: Vec<String>,
    pub basin_id: Option<String>,
    pub return_format: ReturnFormat,
    pub output: Option<Utf8PathBuf>,
}

impl RawRequest {
    pub fn from_config(config: &Config) -> Self {
        let defaults = &config.defaults;
        Self {
            variable: defaults.variable.clone(),
            factor: defaults.factor,
            bbox: BboxInput::Text(defaults.bbox.clone()),
            start_date: defaults.start_date.clone(),
            end_date: defaults.end_date.clone(),
            repository: defaults.repository.clone(),
            collections: CollectionsInput::Text(defaults.collections.clone()),
            query: QueryInput::Text(defaults.query.clone()),
            models: Vec::new(),
            basin_id: None,
            return_format: defaults.return_format,
            output: None,
        }
    }
}

/// Normalised request consumed by the orchestrator.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub variable: String,
    pub factor: f64,
    pub bbox: Option<BoundingBox>,
    pub time_range: Option<TimeRange>,
    pub repository: Repository,
    pub collections: Collections,
    pub predicate: Predicate,
    pub models: Vec<String>,
    pub basin_id: Option<String>,
    pub kind: CatalogKind,
    pub return_format: ReturnFormat,
    pub output: Option<(Utf8PathBuf, OutputFormat)>,
}

pub struct RequestNormalizer<'a> {
    config: &'a Config,
}

impl<'a> RequestNormalizer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn normalize(&self, raw: RawRequest) -> Result<FetchRequest, ClimateError> {
        let bbox = parse_bbox(&raw.bbox)?;
        let time_range = parse_dates(&raw.start_date, &raw.end_date)?;
        let repository = self.parse_repository(&raw.repository)?;
        let collections = parse_collections(&raw.collections);
        let predicate = match parse_query(&raw.query) {
            Ok(predicate) => predicate,
            Err(err) => {
                warn!("{err}; continuing without a catalog filter");
                Predicate::default()
            }
        };
        if !raw.factor.is_finite() {
            return Err(ClimateError::InvalidQuery(format!(
                "scale factor must be finite, got {}",
                raw.factor
            )));
        }
        let output = raw
            .output
            .map(|path| OutputFormat::from_path(&path).map(|format| (path, format)))
            .transpose()?;
        let kind = CatalogKind::select(
            &repository,
            &collections,
            &self.config.forecast_repository,
            &self.config.ensemble_collections,
        );
        let models = raw
            .models
            .into_iter()
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .collect();
        let basin_id = raw
            .basin_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        Ok(FetchRequest {
            variable: raw.variable.trim().to_string(),
            factor: raw.factor,
            bbox,
            time_range,
            repository,
            collections,
            predicate,
            models,
            basin_id,
            kind,
            return_format: raw.return_format,
            output,
        })
    }

    pub fn parse_repository(&self, name: &str) -> Result<Repository, ClimateError> {
        let name = name.trim();
        let name = if name.is_empty() {
            self.config.defaults.repository.as_str()
        } else {
            name
        };
        if let Some(endpoint) = self.config.repositories.get(name) {
            return Ok(Repository {
                name: name.to_string(),
                endpoint: endpoint.clone(),
            });
        }
        // A bare catalog URL selects an unnamed repository.
        if name.starts_with("https://") || name.starts_with("http://") {
            let known = self
                .config
                .repositories
                .iter()
                .find(|(_, url)| url.trim_end_matches('/') == name.trim_end_matches('/'));
            return Ok(Repository {
                name: known.map(|(key, _)| key.clone()).unwrap_or_else(|| name.to_string()),
                endpoint: name.to_string(),
            });
        }
        Err(ClimateError::UnknownRepository(name.to_string()))
    }
}

/// Empty input means no spatial filter, which is distinct from a zero-sized box.
pub fn parse_bbox(input: &BboxInput) -> Result<Option<BoundingBox>, ClimateError> {
    match input {
        BboxInput::Text(text) if text.trim().is_empty() => Ok(None),
        BboxInput::Text(text) => text.parse().map(Some),
        BboxInput::Values(values) if values.is_empty() => Ok(None),
        BboxInput::Values(values) => BoundingBox::from_values(values).map(Some),
        BboxInput::Parts(parts) if parts.is_empty() => Ok(None),
        BboxInput::Parts(parts) => {
            let values = parts
                .iter()
                .map(|part| {
                    part.trim()
                        .parse::<f64>()
                        .map_err(|_| ClimateError::InvalidBbox(format!("{parts:?}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            BoundingBox::from_values(&values).map(Some)
        }
    }
}

/// Both endpoints are day-month-year; both empty means no temporal filter.
pub fn parse_dates(start: &str, end: &str) -> Result<Option<TimeRange>, ClimateError> {
    let (start, end) = (start.trim(), end.trim());
    match (start.is_empty(), end.is_empty()) {
        (true, true) => return Ok(None),
        (true, false) => {
            return Err(ClimateError::InvalidDate("missing start date".to_string()));
        }
        (false, true) => {
            return Err(ClimateError::InvalidDate("missing end date".to_string()));
        }
        (false, false) => {}
    }
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    if start > end {
        return Err(ClimateError::InvalidDate(format!(
            "start {} is after end {}",
            start.format(DATE_FORMAT),
            end.format(DATE_FORMAT)
        )));
    }
    Ok(Some(TimeRange { start, end }))
}

fn parse_date(value: &str) -> Result<NaiveDateTime, ClimateError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map(|date| date.and_time(chrono::NaiveTime::MIN))
        .map_err(|_| ClimateError::InvalidDate(value.to_string()))
}

pub fn parse_collections(input: &CollectionsInput) -> Collections {
    let values = match input {
        CollectionsInput::Text(text) => text
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        CollectionsInput::List(list) => list
            .iter()
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
    };
    Collections::new(values)
}

/// Accepts a JSON object or `key=value` pairs (`cmip6:experiment_id=ssp370,...`),
/// the latter expanding to equality filters.
pub fn parse_query(input: &QueryInput) -> Result<Predicate, ClimateError> {
    let text = match input {
        QueryInput::Structured(map) => return Ok(Predicate::new(map.clone())),
        QueryInput::Text(text) => text.trim(),
    };
    if text.is_empty() {
        return Ok(Predicate::default());
    }
    if text.starts_with('{') {
        return match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(Predicate::new(map)),
            Ok(_) => Err(ClimateError::InvalidQuery(format!(
                "expected a JSON object: {text}"
            ))),
            Err(err) => Err(ClimateError::InvalidQuery(format!("{text}: {err}"))),
        };
    }
    let mut map = Map::new();
    for pair in text.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ClimateError::InvalidQuery(text.to_string()))?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(ClimateError::InvalidQuery(text.to_string()));
        }
        let mut condition = Map::new();
        condition.insert("eq".to_string(), Value::String(value.to_string()));
        map.insert(key.to_string(), Value::Object(condition));
    }
    Ok(Predicate::new(map))
}
