use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde_json::{Value, json};

use climate_eed::app::{App, ArchiveRequest};
use climate_eed::archive::{ArchiveLocation, RemoteArchive};
use climate_eed::cds::CdsClient;
use climate_eed::catalog::{Asset, CatalogClient, CatalogItem, CatalogQuery};
use climate_eed::config::Config;
use climate_eed::domain::{MergeStrategy, OutputFormat, ReturnFormat};
use climate_eed::error::ClimateError;
use climate_eed::grid::{CoordValues, Dataset, GridArray};
use climate_eed::normalize::{
    BboxInput, CollectionsInput, FetchRequest, RawRequest, RequestNormalizer,
};
use climate_eed::opener::{DocumentOpener, ResourceOpener};
use climate_eed::output::JsonOutput;
use climate_eed::store::Store;

const PRECIP: &str = "precipitation_amount_1hour_Accumulation";

#[derive(Default)]
struct MockCatalog {
    items: Vec<CatalogItem>,
    queries: Arc<Mutex<Vec<CatalogQuery>>>,
}

impl MockCatalog {
    fn with_items(items: Vec<CatalogItem>) -> Self {
        Self {
            items,
            queries: Arc::default(),
        }
    }
}

impl CatalogClient for MockCatalog {
    fn search(&self, query: &CatalogQuery) -> Result<Vec<CatalogItem>, ClimateError> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.items.clone())
    }
}

#[derive(Default)]
struct MockOpener {
    failing: Vec<String>,
}

impl ResourceOpener for MockOpener {
    fn open(&self, href: &str) -> Result<Dataset, ClimateError> {
        if self.failing.iter().any(|failing| failing == href) {
            return Err(ClimateError::ResourceHttp("connection reset".to_string()));
        }
        if let Some(month) = href.strip_prefix("mem://era5/1995-") {
            return Ok(Dataset::from(month_grid(month.parse().unwrap())));
        }
        if let Some(model) = href.strip_prefix("mem://cmip/") {
            let mut attrs = BTreeMap::new();
            attrs.insert("source_id".to_string(), json!(model));
            attrs.insert("units".to_string(), json!("K"));
            return Ok(Dataset::from(model_grid().with_attrs(attrs)));
        }
        if let Some(issue) = href.strip_prefix("mem://icisk/") {
            return Ok(forecast_dataset(issue));
        }
        Err(ClimateError::ResourceStatus {
            status: 404,
            message: href.to_string(),
        })
    }
}

struct NoArchive;

impl RemoteArchive for NoArchive {
    fn list(&self, _folder: &str) -> Result<Vec<String>, ClimateError> {
        Err(ClimateError::Archive("not configured".to_string()))
    }

    fn download(&self, _folder: &str, _file: &str) -> Result<Vec<u8>, ClimateError> {
        Err(ClimateError::Archive("not configured".to_string()))
    }
}

fn instant(year: i32, month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Hourly ERA5-like month: latitude descending from -28.0, longitude ascending from 25.0.
fn month_grid(month: u32) -> GridArray {
    let start = instant(1995, month, 1);
    let next = if month == 12 {
        instant(1996, 1, 1)
    } else {
        instant(1995, month + 1, 1)
    };
    let hours = (next - start).num_hours();
    let times = (0..hours)
        .map(|hour| start + TimeDelta::hours(hour))
        .collect::<Vec<_>>();
    let lat = (0..17).map(|i| -28.0 - 0.25 * f64::from(i)).collect::<Vec<_>>();
    let lon = (0..21).map(|i| 25.0 + 0.25 * f64::from(i)).collect::<Vec<_>>();
    let size = times.len() * lat.len() * lon.len();
    GridArray::from_vec(
        PRECIP,
        vec![
            ("time", CoordValues::Time(times)),
            ("lat", CoordValues::Float(lat)),
            ("lon", CoordValues::Float(lon)),
        ],
        vec![0.001; size],
    )
    .unwrap()
}

/// Daily model output on an ascending 1-degree grid.
fn model_grid() -> GridArray {
    let times = (1..=10).map(|day| instant(1995, 1, day)).collect::<Vec<_>>();
    let lat = (0..5).map(|i| -32.0 + f64::from(i)).collect::<Vec<_>>();
    let lon = (0..6).map(|i| 25.0 + f64::from(i)).collect::<Vec<_>>();
    GridArray::from_vec(
        "tasmax",
        vec![
            ("time", CoordValues::Time(times)),
            ("lat", CoordValues::Float(lat)),
            ("lon", CoordValues::Float(lon)),
        ],
        vec![300.0; 10 * 5 * 6],
    )
    .unwrap()
}

fn basin_grid(name: &str, ids: &[&str], value: f64) -> GridArray {
    let times = (1..=3).map(|day| instant(2024, 4, day)).collect::<Vec<_>>();
    let size = times.len() * ids.len();
    GridArray::from_vec(
        name,
        vec![
            ("time", CoordValues::Time(times)),
            (
                "id",
                CoordValues::Label(ids.iter().map(|id| id.to_string()).collect()),
            ),
        ],
        vec![value; size],
    )
    .unwrap()
}

fn forecast_dataset(issue: &str) -> Dataset {
    let mut variables = BTreeMap::new();
    variables.insert(
        "COUT".to_string(),
        basin_grid("COUT", &["301515", "301516"], 1.5),
    );
    variables.insert(
        "QIN".to_string(),
        basin_grid("QIN", &["301515", "301516"], 9.0),
    );
    let mut attrs = BTreeMap::new();
    attrs.insert("issue".to_string(), Value::String(issue.to_string()));
    Dataset { variables, attrs }
}

fn item(id: &str, assets: &[(&str, &str)]) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        collection: None,
        properties: Default::default(),
        assets: assets
            .iter()
            .map(|(name, href)| (name.to_string(), Asset::new(*href)))
            .collect(),
    }
}

fn era5_items(months: std::ops::RangeInclusive<u32>) -> Vec<CatalogItem> {
    months
        .map(|month| {
            let href = format!("mem://era5/1995-{month:02}");
            item(&format!("era5-pds-1995-{month:02}-fc"), &[(PRECIP, href.as_str())])
        })
        .collect()
}

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
    (temp, Store::new_with_root(root))
}

fn request(config: &Config, edit: impl FnOnce(&mut RawRequest)) -> FetchRequest {
    let mut raw = RawRequest::from_config(config);
    edit(&mut raw);
    RequestNormalizer::new(config).normalize(raw).unwrap()
}

#[test]
fn reanalysis_year_concatenates_along_time() {
    let mut config = Config::default();
    config.pool.max_in_flight = Some(4);
    let (_temp, store) = temp_store();
    let request = request(&config, |raw| {
        raw.variable = PRECIP.to_string();
        raw.factor = 1000.0;
        raw.bbox = BboxInput::Text("26.0,-31.0,29.0,-29.0".to_string());
        raw.start_date = "01-01-1995".to_string();
        raw.end_date = "31-12-1995".to_string();
    });
    let catalog = MockCatalog::with_items(era5_items(1..=12));
    let queries = Arc::clone(&catalog.queries);
    let app = App::new(config, store, catalog, MockOpener::default(), NoArchive);

    let result = app.fetch(&request, &JsonOutput).unwrap();
    let grid = result.output.as_grid().unwrap();
    assert_eq!(grid.dims(), &["time", "lat", "lon"]);
    assert_eq!(grid.shape(), &[8760, 9, 13]);
    assert!(grid.data().iter().all(|value| (value - 1.0).abs() < 1e-9));

    let CoordValues::Time(times) = grid.coord("time").unwrap() else {
        panic!("time axis should hold instants");
    };
    assert_eq!(times.first(), Some(&instant(1995, 1, 1)));
    assert!(times.windows(2).all(|pair| pair[0] < pair[1]));

    assert_eq!(result.summary.strategy, MergeStrategy::TimeConcat);
    assert_eq!(result.summary.fetched, 12);
    assert!(result.summary.failures.is_empty());

    let queries = queries.lock().unwrap();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].time_range.is_some());
    assert_eq!(queries[0].collections.as_slice(), &["era5-pds"]);
}

#[test]
fn one_failing_item_leaves_the_other_intact() {
    let config = Config::default();
    let (_temp, store) = temp_store();
    let request = request(&config, |raw| {
        raw.variable = PRECIP.to_string();
        raw.factor = 1000.0;
        raw.bbox = BboxInput::Text("26.0,-31.0,29.0,-29.0".to_string());
    });
    let opener = MockOpener {
        failing: vec!["mem://era5/1995-02".to_string()],
    };
    let app = App::new(
        config,
        store,
        MockCatalog::with_items(era5_items(1..=2)),
        opener,
        NoArchive,
    );

    let result = app.fetch(&request, &JsonOutput).unwrap();
    let grid = result.output.as_grid().unwrap();
    assert_eq!(grid.shape(), &[744, 9, 13]);
    assert_eq!(result.summary.fetched, 1);
    assert_eq!(result.summary.failures.len(), 1);
    assert_eq!(result.summary.failures[0].item_id, "era5-pds-1995-02-fc");
}

#[test]
fn every_item_failing_is_an_empty_result() {
    let config = Config::default();
    let (_temp, store) = temp_store();
    let request = request(&config, |raw| raw.variable = "not_there".to_string());
    let app = App::new(
        config,
        store,
        MockCatalog::with_items(era5_items(1..=3)),
        MockOpener::default(),
        NoArchive,
    );
    assert_matches!(app.fetch(&request, &JsonOutput), Err(ClimateError::EmptyResult));
}

#[test]
fn ensemble_stacks_models_then_selects() {
    let config = Config::default();
    let (_temp, store) = temp_store();
    let request = request(&config, |raw| {
        raw.variable = "tasmax".to_string();
        raw.bbox = BboxInput::Text("26.0,-31.0,29.0,-29.0".to_string());
        raw.start_date = "01-01-1995".to_string();
        raw.end_date = "05-01-1995".to_string();
        raw.collections = CollectionsInput::Text("cil-gdpcir-cc0".to_string());
        raw.models = vec!["CanESM5".to_string(), "NESM3".to_string()];
    });
    let items = ["ACCESS-CM2", "CanESM5", "NESM3"]
        .into_iter()
        .map(|model| {
            let href = format!("mem://cmip/{model}");
            let mut item = item(&format!("cil-gdpcir-{model}"), &[("tasmax", href.as_str())]);
            item.properties
                .insert("cmip6:source_id".to_string(), json!(model));
            item
        })
        .collect();
    let catalog = MockCatalog::with_items(items);
    let app = App::new(config, store, catalog, MockOpener::default(), NoArchive);

    let result = app.fetch(&request, &JsonOutput).unwrap();
    let grid = result.output.as_grid().unwrap();
    assert_eq!(grid.dims(), &["model", "time", "lat", "lon"]);
    assert_eq!(grid.shape(), &[2, 5, 3, 4]);
    assert_eq!(
        grid.coord("model"),
        Some(&CoordValues::Label(vec!["CanESM5".to_string(), "NESM3".to_string()]))
    );
    assert_eq!(grid.attrs().get("units"), Some(&json!("K")));
    assert!(grid.attrs().get("source_id").is_none());
    assert_eq!(result.summary.strategy, MergeStrategy::ModelStack);
}

#[test]
fn ensemble_search_is_not_time_filtered() {
    let config = Config::default();
    let (_temp, store) = temp_store();
    let request = request(&config, |raw| {
        raw.variable = "tasmax".to_string();
        raw.start_date = "01-01-1995".to_string();
        raw.end_date = "05-01-1995".to_string();
        raw.collections = CollectionsInput::Text("cil-gdpcir-cc-by".to_string());
    });
    let catalog = MockCatalog::with_items(vec![item("cil-a", &[("tasmax", "mem://cmip/A")])]);
    let queries = Arc::clone(&catalog.queries);
    let app = App::new(config, store, catalog, MockOpener::default(), NoArchive);

    let result = app.fetch(&request, &JsonOutput).unwrap();
    // Time is selected after stacking instead.
    assert_eq!(result.summary.shape, vec![1, 5, 5, 6]);
    assert_eq!(
        result.output.as_grid().unwrap().coord("model"),
        Some(&CoordValues::Label(vec!["A".to_string()]))
    );
    assert!(queries.lock().unwrap()[0].time_range.is_none());
}

#[test]
fn seasonal_forecast_outer_merges_by_basin() {
    let mut config = Config::default();
    config
        .repositories
        .insert("icisk".to_string(), "https://icisk.example.org/stac".to_string());
    let (temp, store) = temp_store();
    let out = Utf8PathBuf::from_path_buf(temp.path().join("forecast.csv")).unwrap();
    let request = request(&config, |raw| {
        raw.variable = "COUT".to_string();
        raw.factor = 2.0;
        raw.repository = "icisk".to_string();
        raw.collections = CollectionsInput::Text("seasonal-forecast".to_string());
        raw.basin_id = Some("301516".to_string());
        raw.return_format = ReturnFormat::Table;
        raw.output = Some(out.clone());
    });
    assert_eq!(request.output.as_ref().map(|(_, format)| *format), Some(OutputFormat::Csv));
    let catalog = MockCatalog::with_items(vec![
        item("smhi-202404-ecmwf", &[("data", "mem://icisk/202404")]),
        item("smhi-202405-ecmwf", &[("data", "mem://icisk/202405")]),
        item("smhi-no-data", &[("COUT", "mem://icisk/ignored")]),
    ]);
    let app = App::new(config, store, catalog, MockOpener::default(), NoArchive);

    let result = app.fetch(&request, &JsonOutput).unwrap();
    assert_eq!(result.summary.strategy, MergeStrategy::OuterMerge);
    assert_eq!(result.summary.dims, vec!["model", "time", "id"]);
    assert_eq!(result.summary.shape, vec![2, 3, 1]);
    assert_eq!(result.summary.missing, vec!["smhi-no-data"]);

    assert!(result.output.as_grid().is_none());
    let table = result.output.as_table().unwrap();
    assert_eq!(table.columns, vec!["model", "time", "id", "COUT"]);
    assert_eq!(table.rows.len(), 6);
    assert!(table.rows.iter().all(|row| row.value == 3.0));

    let written = std::fs::read_to_string(out.as_std_path()).unwrap();
    let mut lines = written.lines();
    assert_eq!(lines.next(), Some("model,time,id,COUT"));
    assert_eq!(
        lines.next(),
        Some("smhi-202404-ecmwf,2024-04-01T00:00:00,301516,3")
    );
}

#[derive(Default)]
struct MockArchive {
    files: BTreeMap<String, Vec<u8>>,
    downloads: Arc<Mutex<Vec<String>>>,
}

impl RemoteArchive for MockArchive {
    fn list(&self, folder: &str) -> Result<Vec<String>, ClimateError> {
        assert_eq!(folder, "/climate_data/georgia/seasonal_forecast/202404");
        let mut listing = self.files.keys().cloned().collect::<Vec<_>>();
        listing.push("README.txt".to_string());
        Ok(listing)
    }

    fn download(&self, _folder: &str, file: &str) -> Result<Vec<u8>, ClimateError> {
        self.downloads.lock().unwrap().push(file.to_string());
        self.files
            .get(file)
            .cloned()
            .ok_or_else(|| ClimateError::Archive(format!("550 {file}")))
    }
}

fn netcdf_bytes(grid: GridArray) -> Vec<u8> {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("grid.nc");
    climate_eed::nc::write_array(&grid, &path).unwrap();
    std::fs::read(path).unwrap()
}

#[test]
fn archive_files_are_cached_and_merged_by_model() {
    let mut config = Config::default();
    config.archive.root = "/climate_data".to_string();
    let (_temp, store) = temp_store();
    let mut archive = MockArchive::default();
    archive.files.insert(
        "georgia_COUT_EC-Earth.nc".to_string(),
        netcdf_bytes(basin_grid("COUT", &["301515", "301516"], 1.0)),
    );
    archive.files.insert(
        "georgia_COUT_ECMWF.nc".to_string(),
        netcdf_bytes(basin_grid("COUT", &["301516", "301517"], 2.0)),
    );
    let downloads = Arc::clone(&archive.downloads);
    let app = App::new(
        config,
        store,
        MockCatalog::default(),
        DocumentOpener::new().unwrap(),
        archive,
    );
    let request = ArchiveRequest {
        location: ArchiveLocation {
            site: "georgia".to_string(),
            category: "seasonal_forecast".to_string(),
            issue_date: "202404".to_string(),
        },
        variable: String::new(),
        factor: 1.0,
        basin_id: None,
        return_format: ReturnFormat::Grid,
        output: None,
    };

    let first = app.fetch_archive(&request, &JsonOutput).unwrap();
    let grid = first.output.as_grid().unwrap();
    assert_eq!(grid.dims(), &["model", "time", "id"]);
    assert_eq!(
        grid.coord("model"),
        Some(&CoordValues::Label(vec!["EC-Earth".to_string(), "ECMWF".to_string()]))
    );
    assert_eq!(grid.shape(), &[2, 3, 3]);
    assert!(grid.data()[[0, 0, 2]].is_nan());
    assert_eq!(grid.data()[[1, 0, 2]], 2.0);

    let cached = app
        .store()
        .archive_file_path("seasonal_forecast", "202404", "georgia_COUT_ECMWF.nc");
    assert!(Store::exists(&cached));

    let second = app.fetch_archive(&request, &JsonOutput).unwrap();
    assert_eq!(second.summary.shape, first.summary.shape);
    assert_eq!(downloads.lock().unwrap().len(), 2);
}

#[test]
fn variables_come_from_the_last_item() {
    let config = Config::default();
    let (_temp, store) = temp_store();
    let catalog = MockCatalog::with_items(vec![
        item("first", &[("old_var", "mem://x")]),
        item(
            "last",
            &[
                ("air_temperature_at_2_metres", "mem://a"),
                (PRECIP, "mem://b"),
            ],
        ),
    ]);
    let app = App::new(config, store, catalog, MockOpener::default(), NoArchive);
    let repository = RequestNormalizer::new(app.config())
        .parse_repository("planetary")
        .unwrap();
    let collections = climate_eed::normalize::parse_collections(&CollectionsInput::Text(
        "era5-pds".to_string(),
    ));
    let result = app
        .list_variables(&repository, &collections, &JsonOutput)
        .unwrap();
    assert_eq!(
        result.variables,
        vec!["air_temperature_at_2_metres", PRECIP]
    );
}

#[test]
fn repositories_flag_the_forecast_catalog() {
    let mut config = Config::default();
    config
        .repositories
        .insert("icisk".to_string(), "https://icisk.example.org/stac".to_string());
    let (_temp, store) = temp_store();
    let app = App::new(
        config,
        store,
        MockCatalog::default(),
        MockOpener::default(),
        NoArchive,
    );
    let result = app.list_repositories();
    let names = result
        .repositories
        .iter()
        .map(|entry| (entry.name.as_str(), entry.seasonal_forecast))
        .collect::<Vec<_>>();
    assert_eq!(names, vec![("icisk", true), ("planetary", false)]);
}

struct MockCds {
    document: Vec<u8>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl CdsClient for MockCds {
    fn retrieve(
        &self,
        dataset: &str,
        request: &Value,
        destination: &Utf8Path,
    ) -> Result<u64, ClimateError> {
        self.requests
            .lock()
            .unwrap()
            .push((dataset.to_string(), request.clone()));
        Store::write_bytes_atomic(destination, &self.document)?;
        Ok(self.document.len() as u64)
    }
}

#[test]
fn retrieved_file_lands_in_cache_and_opens() {
    let (_temp, store) = temp_store();
    let expected_path = store.retrieval_path(
        "seasonal-monthly-single-levels",
        "seasonal-monthly-single-levels.download",
    );
    let app = App::new(
        Config::default(),
        store,
        MockCatalog::default(),
        DocumentOpener::new().unwrap(),
        NoArchive,
    );
    let client = MockCds {
        document: netcdf_bytes(basin_grid("COUT", &["301515"], 4.0)),
        requests: Arc::default(),
    };
    let request = json!({
        "originating_centre": "ecmwf",
        "variable": "total_precipitation",
        "year": "2024",
        "month": "04",
    });

    let result = app
        .retrieve(
            &client,
            "seasonal-monthly-single-levels",
            &request,
            None,
            &JsonOutput,
        )
        .unwrap();
    assert_eq!(result.path, expected_path.as_str());
    assert_eq!(result.bytes, client.document.len() as u64);
    assert_eq!(
        client.requests.lock().unwrap()[0],
        ("seasonal-monthly-single-levels".to_string(), request.clone())
    );

    let dataset = app.open_retrieved(&result).unwrap();
    let cout = dataset.variable("COUT").unwrap();
    assert_eq!(cout.dims(), &["time", "id"]);
    assert!(cout.data().iter().all(|value| *value == 4.0));
}
