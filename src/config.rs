use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ReturnFormat;
use crate::error::ClimateError;
use crate::pool::PoolOptions;

pub const CONFIG_FILE: &str = "climate-eed.json";
pub const PLANETARY_URL: &str = "https://planetarycomputer.microsoft.com/api/stac/v1/";
pub const CDS_URL: &str = "https://cds.climate.copernicus.eu/api/v2";

/// Tool configuration. Every default lives in the `Default` impls below.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub defaults: RequestDefaults,
    /// Repository name to catalog root URL.
    pub repositories: BTreeMap<String, String>,
    pub ensemble_collections: Vec<String>,
    /// Repository whose catalog holds seasonal forecasts indexed by basin id.
    pub forecast_repository: String,
    pub forecast_asset: String,
    pub forecast_coords: Vec<String>,
    /// Item property carrying the model name in ensemble catalogs.
    pub model_property: String,
    pub pool: PoolConfig,
    pub archive: ArchiveConfig,
    pub cds: CdsConfig,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub variable: String,
    pub factor: f64,
    pub bbox: String,
    pub start_date: String,
    pub end_date: String,
    pub repository: String,
    pub collections: String,
    pub query: String,
    pub return_format: ReturnFormat,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_in_flight: Option<usize>,
    pub task_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub host: String,
    pub port: u16,
    pub root: String,
    pub user: String,
    pub password: String,
    pub category: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CdsConfig {
    pub url: String,
    pub key: Option<String>,
    pub poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let mut repositories = BTreeMap::new();
        repositories.insert("planetary".to_string(), PLANETARY_URL.to_string());
        Self {
            defaults: RequestDefaults::default(),
            repositories,
            ensemble_collections: vec![
                "cil-gdpcir-cc0".to_string(),
                "cil-gdpcir-cc-by".to_string(),
            ],
            forecast_repository: "icisk".to_string(),
            forecast_asset: "data".to_string(),
            forecast_coords: ["x", "y", "z", "time", "id"]
                .into_iter()
                .map(String::from)
                .collect(),
            model_property: "cmip6:source_id".to_string(),
            pool: PoolConfig::default(),
            archive: ArchiveConfig::default(),
            cds: CdsConfig::default(),
            cache_dir: None,
        }
    }
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            variable: String::new(),
            factor: 1.0,
            bbox: String::new(),
            start_date: String::new(),
            end_date: String::new(),
            repository: "planetary".to_string(),
            collections: "era5-pds".to_string(),
            query: String::new(),
            return_format: ReturnFormat::Grid,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 21,
            root: String::new(),
            user: String::new(),
            password: String::new(),
            category: "seasonal_forecast".to_string(),
        }
    }
}

impl Default for CdsConfig {
    fn default() -> Self {
        Self {
            url: CDS_URL.to_string(),
            key: None,
            poll_interval_secs: 5,
        }
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            max_in_flight: self.max_in_flight.filter(|cap| *cap > 0),
            task_timeout: self.task_timeout_secs.map(Duration::from_secs),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file, then layers environment overrides (including `.env`).
    pub fn resolve(path: Option<&str>) -> Result<Config, ClimateError> {
        let mut config = Self::read(path)?;
        dotenvy::dotenv().ok();
        Self::apply_env(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn read(path: Option<&str>) -> Result<Config, ClimateError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ClimateError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, ClimateError> {
        serde_json::from_str(content).map_err(|err| ClimateError::ConfigParse(err.to_string()))
    }

    pub fn apply_env<F>(config: &mut Config, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = lookup("CLIMATE_EED_FTP_HOST") {
            config.archive.host = host;
        }
        if let Some(root) = lookup("CLIMATE_EED_FTP_DIR") {
            config.archive.root = root;
        }
        if let Some(user) = lookup("CLIMATE_EED_FTP_USER") {
            config.archive.user = user;
        }
        if let Some(password) = lookup("CLIMATE_EED_FTP_PASS") {
            config.archive.password = password;
        }
        if let Some(url) = lookup("CDSAPI_URL") {
            config.cds.url = url;
        }
        if let Some(key) = lookup("CDSAPI_KEY") {
            config.cds.key = Some(key);
        }

        let mut names = config.repositories.keys().cloned().collect::<Vec<_>>();
        if !names.contains(&config.forecast_repository) {
            names.push(config.forecast_repository.clone());
        }
        for name in names {
            let key = format!("CLIMATE_EED_{}_URL", name.to_uppercase().replace('-', "_"));
            if let Some(url) = lookup(&key) {
                config.repositories.insert(name, url);
            }
        }
    }
}
