//! Per-item retrieval.
//!
//! Every fetch ends in an [`Outcome`]; errors are folded into
//! [`Outcome::Failed`] so a task never propagates past its worker.

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::debug;

use crate::archive::{RemoteArchive, model_from_file_name};
use crate::catalog::CatalogItem;
use crate::domain::{BoundingBox, FetchShape};
use crate::error::ClimateError;
use crate::grid::{GridArray, Label};
use crate::opener::ResourceOpener;
use crate::store::Store;

pub const MODEL_DIM: &str = "model";
pub const BASIN_DIM: &str = "id";

/// A forecast file on the archive feed and where it is cached locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveFile {
    pub folder: String,
    pub name: String,
    pub local_path: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskSource {
    Catalog(CatalogItem),
    Archive(ArchiveFile),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchTask {
    pub source: TaskSource,
    pub shape: FetchShape,
    pub variable: String,
    pub bbox: Option<BoundingBox>,
    pub factor: f64,
    pub basin_id: Option<String>,
}

impl FetchTask {
    pub fn id(&self) -> &str {
        match &self.source {
            TaskSource::Catalog(item) => &item.id,
            TaskSource::Archive(file) => &file.name,
        }
    }
}

/// A fetched array with its provenance.
#[derive(Debug, Clone)]
pub struct PartialResult {
    pub source_id: String,
    pub model: Option<String>,
    pub array: GridArray,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchFailure {
    pub item_id: String,
    pub cause: String,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Fetched(PartialResult),
    /// The item has no asset for the variable; it contributes nothing.
    AssetMissing { item_id: String },
    Failed(FetchFailure),
}

impl Outcome {
    pub fn failed(item_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Outcome::Failed(FetchFailure {
            item_id: item_id.into(),
            cause: cause.into(),
        })
    }

    pub fn as_fetched(&self) -> Option<&PartialResult> {
        match self {
            Outcome::Fetched(partial) => Some(partial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub model_property: String,
    pub forecast_asset: String,
    pub forecast_coords: Vec<String>,
}

pub struct ItemFetcher<O: ResourceOpener, A: RemoteArchive> {
    opener: O,
    archive: A,
    settings: FetchSettings,
}

impl<O: ResourceOpener, A: RemoteArchive> ItemFetcher<O, A> {
    pub fn new(opener: O, archive: A, settings: FetchSettings) -> Self {
        Self {
            opener,
            archive,
            settings,
        }
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    pub fn fetch(&self, task: &FetchTask) -> Outcome {
        let result = match (&task.source, task.shape) {
            (TaskSource::Catalog(item), FetchShape::Item) => self.fetch_item(item, task),
            (TaskSource::Catalog(item), FetchShape::Model) => self.fetch_model(item, task),
            (TaskSource::Catalog(item), FetchShape::Forecast) => self.fetch_forecast(item, task),
            (TaskSource::Archive(file), FetchShape::ArchiveFile) => {
                self.fetch_archive_file(file, task)
            }
            (_, shape) => Err(ClimateError::InvalidGrid(format!(
                "fetch shape {shape:?} does not apply to {}",
                task.id()
            ))),
        };
        match result {
            Ok(Some(partial)) => Outcome::Fetched(partial),
            Ok(None) => {
                debug!(item = task.id(), variable = %task.variable, "asset missing");
                Outcome::AssetMissing {
                    item_id: task.id().to_string(),
                }
            }
            Err(err) => Outcome::failed(task.id(), err.to_string()),
        }
    }

    /// Reanalysis item: the variable's asset, subset to the box and scaled.
    fn fetch_item(
        &self,
        item: &CatalogItem,
        task: &FetchTask,
    ) -> Result<Option<PartialResult>, ClimateError> {
        let Some(asset) = item.asset(&task.variable) else {
            return Ok(None);
        };
        let dataset = self.opener.open(&asset.href)?;
        let Some(mut array) = dataset.take_variable(&task.variable) else {
            return Err(ClimateError::Decode(format!(
                "{} does not contain variable {}",
                asset.href, task.variable
            )));
        };
        if let Some(bbox) = task.bbox {
            // Latitude is stored north to south.
            array = array
                .slice_by_value("lat", bbox.max_lat, bbox.min_lat)?
                .slice_by_value("lon", bbox.min_lon, bbox.max_lon)?;
            array.scale(task.factor);
        }
        Ok(Some(PartialResult {
            source_id: item.id.clone(),
            model: None,
            array,
        }))
    }

    /// Ensemble member: the whole array, left on its native grid for the model merge.
    fn fetch_model(
        &self,
        item: &CatalogItem,
        task: &FetchTask,
    ) -> Result<Option<PartialResult>, ClimateError> {
        let Some(asset) = item.asset(&task.variable) else {
            return Ok(None);
        };
        let dataset = self.opener.open(&asset.href)?;
        let Some(array) = dataset.take_variable(&task.variable) else {
            return Err(ClimateError::Decode(format!(
                "{} does not contain variable {}",
                asset.href, task.variable
            )));
        };
        let model = item
            .property_str(&self.settings.model_property)
            .map(str::to_string)
            .or_else(|| {
                array
                    .attrs()
                    .get("source_id")
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| item.id.clone());
        Ok(Some(PartialResult {
            source_id: item.id.clone(),
            model: Some(model),
            array,
        }))
    }

    /// Seasonal forecast item: the fixed data asset, tagged with the item as model.
    fn fetch_forecast(
        &self,
        item: &CatalogItem,
        task: &FetchTask,
    ) -> Result<Option<PartialResult>, ClimateError> {
        let Some(asset) = item.asset(&self.settings.forecast_asset) else {
            return Ok(None);
        };
        let mut dataset = self.opener.open(&asset.href)?;
        let mut keep = vec![task.variable.as_str()];
        keep.extend(self.settings.forecast_coords.iter().map(String::as_str));
        dataset.retain(&keep);
        let Some(array) = dataset.take_variable(&task.variable) else {
            return Ok(None);
        };
        let model = item.id.clone();
        let array = self.tag_and_scale(array, &model, task)?;
        Ok(Some(PartialResult {
            source_id: item.id.clone(),
            model: Some(model),
            array,
        }))
    }

    /// Archive forecast file: cached locally, then handled like a forecast item.
    fn fetch_archive_file(
        &self,
        file: &ArchiveFile,
        task: &FetchTask,
    ) -> Result<Option<PartialResult>, ClimateError> {
        if Store::exists(&file.local_path) {
            debug!(file = %file.local_path, "archive file already cached");
        } else {
            let bytes = self.archive.download(&file.folder, &file.name)?;
            Store::write_bytes_atomic(&file.local_path, &bytes)?;
        }
        let dataset = self.opener.open(file.local_path.as_str())?;
        let Some(array) = dataset.take_variable(&task.variable) else {
            return Ok(None);
        };
        let model = model_from_file_name(&file.name);
        let array = self.tag_and_scale(array, &model, task)?;
        Ok(Some(PartialResult {
            source_id: file.name.clone(),
            model: Some(model),
            array,
        }))
    }

    fn tag_and_scale(
        &self,
        array: GridArray,
        model: &str,
        task: &FetchTask,
    ) -> Result<GridArray, ClimateError> {
        let mut array = array.expand_dim(MODEL_DIM, model)?;
        if let Some(basin_id) = &task.basin_id {
            array = select_basin(&array, basin_id)?;
        }
        array.scale(task.factor);
        Ok(array)
    }
}

/// Basin ids may be stored as labels or as numbers.
fn select_basin(array: &GridArray, basin_id: &str) -> Result<GridArray, ClimateError> {
    let coord = array.coord(BASIN_DIM).ok_or_else(|| {
        ClimateError::Selection(format!("{} has no {BASIN_DIM} dimension", array.name()))
    })?;
    let positions = (0..coord.len())
        .filter(|&i| match coord.label(i) {
            Some(Label::Text(value)) => value == basin_id,
            Some(Label::Float(value)) => basin_id
                .parse::<f64>()
                .map(|wanted| wanted == value)
                .unwrap_or(false),
            _ => false,
        })
        .collect::<Vec<_>>();
    if positions.is_empty() {
        return Err(ClimateError::Selection(format!(
            "{BASIN_DIM}={basin_id} not found"
        )));
    }
    array.take(BASIN_DIM, &positions)
}
