use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveLocation, RemoteArchive, forecast_files};
use crate::catalog::{CatalogClient, CatalogQuery};
use crate::cds::CdsClient;
use crate::config::Config;
use crate::domain::{
    Collections, FetchShape, MergeStrategy, OutputFormat, Predicate, Repository,
    ReturnFormat,
};
use crate::error::ClimateError;
use crate::fetch::{ArchiveFile, FetchFailure, FetchSettings, FetchTask, ItemFetcher, Outcome, TaskSource};
use crate::grid::{Dataset, GridArray, Table};
use crate::merge::{Merger, Selection};
use crate::normalize::FetchRequest;
use crate::opener::ResourceOpener;
use crate::output::write_output;
use crate::pool::TaskPool;
use crate::store::Store;

pub const DEFAULT_ARCHIVE_VARIABLE: &str = "COUT";

#[derive(Debug, Clone)]
pub enum MergedOutput {
    Grid(GridArray),
    Table(Table),
}

impl MergedOutput {
    pub fn as_grid(&self) -> Option<&GridArray> {
        match self {
            MergedOutput::Grid(array) => Some(array),
            MergedOutput::Table(_) => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            MergedOutput::Table(table) => Some(table),
            MergedOutput::Grid(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub output: MergedOutput,
    pub summary: FetchSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub source: String,
    pub variable: String,
    pub strategy: MergeStrategy,
    pub tasks: usize,
    pub fetched: usize,
    pub missing: Vec<String>,
    pub failures: Vec<FetchFailure>,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariablesResult {
    pub repository: String,
    pub collections: Vec<String>,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoriesResult {
    pub repositories: Vec<RepositoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryEntry {
    pub name: String,
    pub endpoint: String,
    pub seasonal_forecast: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResult {
    pub dataset: String,
    pub path: String,
    pub bytes: u64,
}

/// Parameters of a forecast request against the archive feed.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub location: ArchiveLocation,
    pub variable: String,
    pub factor: f64,
    pub basin_id: Option<String>,
    pub return_format: ReturnFormat,
    pub output: Option<(Utf8PathBuf, OutputFormat)>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Drives every request through search, concurrent fetch, merge and output.
pub struct App<C, O, A>
where
    C: CatalogClient,
    O: ResourceOpener + 'static,
    A: RemoteArchive + 'static,
{
    config: Config,
    store: Store,
    catalog: C,
    fetcher: Arc<ItemFetcher<O, A>>,
    pool: TaskPool,
}

impl<C, O, A> App<C, O, A>
where
    C: CatalogClient,
    O: ResourceOpener + 'static,
    A: RemoteArchive + 'static,
{
    pub fn new(config: Config, store: Store, catalog: C, opener: O, archive: A) -> Self {
        let settings = FetchSettings {
            model_property: config.model_property.clone(),
            forecast_asset: config.forecast_asset.clone(),
            forecast_coords: config.forecast_coords.clone(),
        };
        let pool = TaskPool::new(config.pool.options());
        Self {
            config,
            store,
            catalog,
            fetcher: Arc::new(ItemFetcher::new(opener, archive, settings)),
            pool,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn fetch(
        &self,
        request: &FetchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, ClimateError> {
        let started = Instant::now();
        let time_range = if request.kind.filters_time_in_search() {
            request.time_range
        } else {
            None
        };
        let query = CatalogQuery {
            endpoint: request.repository.endpoint.clone(),
            collections: request.collections.clone(),
            time_range,
            predicate: request.predicate.clone(),
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase=Search; repository={} collections={}",
                request.repository.name, request.collections
            ),
            elapsed: None,
        });
        let items = self.catalog.search(&query)?;
        info!(
            repository = %request.repository.name,
            kind = ?request.kind,
            items = items.len(),
            "catalog search complete"
        );

        let shape = request.kind.fetch_shape();
        let tasks = items
            .into_iter()
            .map(|item| FetchTask {
                source: TaskSource::Catalog(item),
                shape,
                variable: request.variable.clone(),
                bbox: request.bbox,
                factor: request.factor,
                basin_id: request.basin_id.clone(),
            })
            .collect::<Vec<_>>();

        let selection = Selection {
            bbox: request.bbox,
            time_range: request.time_range,
            models: request.models.clone(),
        };
        self.fetch_and_merge(
            tasks,
            request.kind.strategy(),
            &selection,
            Target {
                source: request.repository.name.clone(),
                variable: &request.variable,
                return_format: request.return_format,
                output: request.output.as_ref(),
            },
            sink,
            started,
        )
    }

    /// Seasonal forecast files published on the archive feed for one issue.
    pub fn fetch_archive(
        &self,
        request: &ArchiveRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, ClimateError> {
        let started = Instant::now();
        let location = &request.location;
        let folder = location.remote_folder(&self.config.archive.root);
        sink.event(ProgressEvent {
            message: format!("phase=Search; listing {folder}"),
            elapsed: None,
        });
        let listing = self.fetcher.archive().list(&folder)?;
        let files = forecast_files(&listing);
        info!(folder = %folder, files = files.len(), "archive listing complete");

        let variable = if request.variable.trim().is_empty() {
            DEFAULT_ARCHIVE_VARIABLE.to_string()
        } else {
            request.variable.trim().to_string()
        };
        let tasks = files
            .into_iter()
            .map(|name| FetchTask {
                source: TaskSource::Archive(ArchiveFile {
                    local_path: self.store.archive_file_path(
                        &location.category,
                        &location.issue_date,
                        &name,
                    ),
                    folder: folder.clone(),
                    name,
                }),
                shape: FetchShape::ArchiveFile,
                variable: variable.clone(),
                bbox: None,
                factor: request.factor,
                basin_id: request.basin_id.clone(),
            })
            .collect::<Vec<_>>();

        self.fetch_and_merge(
            tasks,
            MergeStrategy::OuterMerge,
            &Selection::default(),
            Target {
                source: folder,
                variable: &variable,
                return_format: request.return_format,
                output: request.output.as_ref(),
            },
            sink,
            started,
        )
    }

    /// Asset names of the last item the catalog returns.
    pub fn list_variables(
        &self,
        repository: &Repository,
        collections: &Collections,
        sink: &dyn ProgressSink,
    ) -> Result<VariablesResult, ClimateError> {
        sink.event(ProgressEvent {
            message: format!("phase=Search; listing variables of {}", repository.name),
            elapsed: None,
        });
        let query = CatalogQuery {
            endpoint: repository.endpoint.clone(),
            collections: collections.clone(),
            time_range: None,
            predicate: Predicate::default(),
        };
        let items = self.catalog.search(&query)?;
        let variables = items
            .last()
            .map(|item| item.assets.keys().cloned().collect())
            .unwrap_or_default();
        Ok(VariablesResult {
            repository: repository.name.clone(),
            collections: collections.as_slice().to_vec(),
            variables,
        })
    }

    pub fn list_repositories(&self) -> RepositoriesResult {
        let repositories = self
            .config
            .repositories
            .iter()
            .map(|(name, endpoint)| RepositoryEntry {
                name: name.clone(),
                endpoint: endpoint.clone(),
                seasonal_forecast: *name == self.config.forecast_repository,
            })
            .collect();
        RepositoriesResult { repositories }
    }

    /// Submits a request to the climate data store and downloads the result.
    ///
    /// Without an explicit destination the file lands in the local cache.
    pub fn retrieve<D: CdsClient>(
        &self,
        client: &D,
        dataset: &str,
        request: &Value,
        destination: Option<Utf8PathBuf>,
        sink: &dyn ProgressSink,
    ) -> Result<RetrieveResult, ClimateError> {
        let started = Instant::now();
        let path = destination
            .unwrap_or_else(|| self.store.retrieval_path(dataset, &format!("{dataset}.download")));
        sink.event(ProgressEvent {
            message: format!("phase=Retrieve; dataset={dataset}"),
            elapsed: None,
        });
        let bytes = client.retrieve(dataset, request, &path)?;
        sink.event(ProgressEvent {
            message: format!("phase=Done; wrote {path}"),
            elapsed: Some(started.elapsed()),
        });
        Ok(RetrieveResult {
            dataset: dataset.to_string(),
            path: path.to_string(),
            bytes,
        })
    }

    /// Opens a previously retrieved file with the configured resource opener.
    pub fn open_retrieved(&self, result: &RetrieveResult) -> Result<Dataset, ClimateError> {
        self.fetcher.opener().open(&result.path)
    }

    fn fetch_and_merge(
        &self,
        tasks: Vec<FetchTask>,
        strategy: MergeStrategy,
        selection: &Selection,
        target: Target<'_>,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<FetchResult, ClimateError> {
        let task_count = tasks.len();
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {task_count} tasks"),
            elapsed: Some(started.elapsed()),
        });
        let fetcher = Arc::clone(&self.fetcher);
        let work = Arc::new(move |task: &FetchTask| fetcher.fetch(task));
        let results = self.pool.run_all(tasks, work);

        let mut missing = Vec::new();
        let mut failures = Vec::new();
        let mut outcomes = Vec::with_capacity(results.len());
        for (task, outcome) in results {
            match &outcome {
                Outcome::Fetched(_) => {}
                Outcome::AssetMissing { item_id } => {
                    debug!(item = %item_id, variable = %task.variable, "no asset for variable");
                    missing.push(item_id.clone());
                }
                Outcome::Failed(failure) => {
                    warn!(item = %failure.item_id, cause = %failure.cause, "fetch failed");
                    failures.push(failure.clone());
                }
            }
            outcomes.push(outcome);
        }
        let fetched = task_count - missing.len() - failures.len();

        sink.event(ProgressEvent {
            message: format!("phase=Merge; strategy={strategy} fetched={fetched}"),
            elapsed: Some(started.elapsed()),
        });
        let merged = Merger::merge(&outcomes, strategy, selection)?;

        let output_path = match target.output {
            Some((path, format)) => {
                sink.event(ProgressEvent {
                    message: format!("phase=Write; {path}"),
                    elapsed: Some(started.elapsed()),
                });
                write_output(&merged, path, *format)?;
                Some(path.to_string())
            }
            None => None,
        };

        let summary = FetchSummary {
            source: target.source,
            variable: target.variable.to_string(),
            strategy,
            tasks: task_count,
            fetched,
            missing,
            failures,
            dims: merged.dims().to_vec(),
            shape: merged.shape().to_vec(),
            output_path,
        };
        sink.event(ProgressEvent {
            message: format!("phase=Done; shape={:?}", summary.shape),
            elapsed: Some(started.elapsed()),
        });

        let output = match target.return_format {
            ReturnFormat::Grid => MergedOutput::Grid(merged),
            ReturnFormat::Table => MergedOutput::Table(merged.to_table()),
        };
        Ok(FetchResult { output, summary })
    }
}

struct Target<'a> {
    source: String,
    variable: &'a str,
    return_format: ReturnFormat,
    output: Option<&'a (Utf8PathBuf, OutputFormat)>,
}

