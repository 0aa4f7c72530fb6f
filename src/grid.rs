//! Gridded arrays with named, labeled axes.
//!
//! A [`GridArray`] is one numeric variable: an n-dimensional `f64` array whose
//! every axis has a name and a coordinate vector of matching length. A
//! [`Dataset`] groups several variables opened from one resource. NaN is the
//! "no data" value throughout.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClimateError;

pub type Attrs = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "lowercase")]
pub enum CoordValues {
    Float(Vec<f64>),
    Time(Vec<NaiveDateTime>),
    Label(Vec<String>),
}

impl CoordValues {
    pub fn len(&self) -> usize {
        match self {
            CoordValues::Float(values) => values.len(),
            CoordValues::Time(values) => values.len(),
            CoordValues::Label(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoordValues::Float(_) => "float",
            CoordValues::Time(_) => "time",
            CoordValues::Label(_) => "label",
        }
    }

    pub fn label(&self, index: usize) -> Option<Label> {
        match self {
            CoordValues::Float(values) => values.get(index).copied().map(Label::Float),
            CoordValues::Time(values) => values.get(index).copied().map(Label::Time),
            CoordValues::Label(values) => values.get(index).cloned().map(Label::Text),
        }
    }

    pub fn select(&self, positions: &[usize]) -> CoordValues {
        match self {
            CoordValues::Float(values) => {
                CoordValues::Float(positions.iter().map(|&i| values[i]).collect())
            }
            CoordValues::Time(values) => {
                CoordValues::Time(positions.iter().map(|&i| values[i]).collect())
            }
            CoordValues::Label(values) => {
                CoordValues::Label(positions.iter().map(|&i| values[i].clone()).collect())
            }
        }
    }

    /// Appends coordinate vectors of the same kind; `None` on a kind mismatch.
    pub fn concat(parts: &[&CoordValues]) -> Option<CoordValues> {
        let first = parts.first()?;
        let mut out = match first {
            CoordValues::Float(_) => CoordValues::Float(Vec::new()),
            CoordValues::Time(_) => CoordValues::Time(Vec::new()),
            CoordValues::Label(_) => CoordValues::Label(Vec::new()),
        };
        for part in parts {
            match (&mut out, part) {
                (CoordValues::Float(acc), CoordValues::Float(values)) => {
                    acc.extend_from_slice(values)
                }
                (CoordValues::Time(acc), CoordValues::Time(values)) => {
                    acc.extend_from_slice(values)
                }
                (CoordValues::Label(acc), CoordValues::Label(values)) => {
                    acc.extend(values.iter().cloned())
                }
                _ => return None,
            }
        }
        Some(out)
    }
}

/// A single coordinate value.
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    Float(f64),
    Time(NaiveDateTime),
    Text(String),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Float(value) => write!(f, "{value}"),
            Label::Time(value) => write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S")),
            Label::Text(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridArray {
    name: String,
    dims: Vec<String>,
    coords: Vec<CoordValues>,
    data: ArrayD<f64>,
    attrs: Attrs,
}

impl GridArray {
    pub fn new(
        name: impl Into<String>,
        dims: Vec<String>,
        coords: Vec<CoordValues>,
        data: ArrayD<f64>,
    ) -> Result<Self, ClimateError> {
        let name = name.into();
        if dims.len() != coords.len() || dims.len() != data.ndim() {
            return Err(ClimateError::InvalidGrid(format!(
                "{name}: {} dims, {} coords, {}-d data",
                dims.len(),
                coords.len(),
                data.ndim()
            )));
        }
        for (axis, (dim, coord)) in dims.iter().zip(&coords).enumerate() {
            if coord.len() != data.shape()[axis] {
                return Err(ClimateError::InvalidGrid(format!(
                    "{name}: coordinate {dim} has {} labels for axis of length {}",
                    coord.len(),
                    data.shape()[axis]
                )));
            }
        }
        for (i, dim) in dims.iter().enumerate() {
            if dims[..i].contains(dim) {
                return Err(ClimateError::InvalidGrid(format!(
                    "{name}: duplicate dimension {dim}"
                )));
            }
        }
        Ok(Self {
            name,
            dims,
            coords,
            data,
            attrs: Attrs::new(),
        })
    }

    pub fn from_vec(
        name: impl Into<String>,
        axes: Vec<(&str, CoordValues)>,
        values: Vec<f64>,
    ) -> Result<Self, ClimateError> {
        let name = name.into();
        let shape = axes.iter().map(|(_, coord)| coord.len()).collect::<Vec<_>>();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|err| ClimateError::InvalidGrid(format!("{name}: {err}")))?;
        let (dims, coords) = axes
            .into_iter()
            .map(|(dim, coord)| (dim.to_string(), coord))
            .unzip();
        Self::new(name, dims, coords, data)
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn coords(&self) -> &[CoordValues] {
        &self.coords
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dim_index(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|name| name == dim)
    }

    pub fn coord(&self, dim: &str) -> Option<&CoordValues> {
        self.dim_index(dim).map(|axis| &self.coords[axis])
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.mapv_inplace(|value| value * factor);
    }

    /// Keeps the given positions along `dim`, in the given order.
    pub fn take(&self, dim: &str, positions: &[usize]) -> Result<GridArray, ClimateError> {
        let axis = self.require_dim(dim)?;
        let mut coords = self.coords.clone();
        coords[axis] = self.coords[axis].select(positions);
        Ok(GridArray {
            name: self.name.clone(),
            dims: self.dims.clone(),
            coords,
            data: self.data.select(Axis(axis), positions),
            attrs: self.attrs.clone(),
        })
    }

    /// Label slice on a numeric coordinate, inclusive on both ends.
    ///
    /// Follows label-slice semantics on a monotonic index: `start..=stop` walks
    /// the coordinate in its stored direction, so a descending coordinate must
    /// be sliced with `start >= stop`. A slice running against the stored
    /// direction selects nothing.
    pub fn slice_by_value(&self, dim: &str, start: f64, stop: f64) -> Result<GridArray, ClimateError> {
        let axis = self.require_dim(dim)?;
        let CoordValues::Float(values) = &self.coords[axis] else {
            return Err(ClimateError::Selection(format!(
                "{dim} is a {} coordinate, expected float",
                self.coords[axis].kind()
            )));
        };
        let positions = slice_positions(values, &start, &stop);
        self.take(dim, &positions)
    }

    pub fn slice_by_time(
        &self,
        dim: &str,
        start: NaiveDateTime,
        stop: NaiveDateTime,
    ) -> Result<GridArray, ClimateError> {
        let axis = self.require_dim(dim)?;
        let CoordValues::Time(values) = &self.coords[axis] else {
            return Err(ClimateError::Selection(format!(
                "{dim} is a {} coordinate, expected time",
                self.coords[axis].kind()
            )));
        };
        let positions = slice_positions(values, &start, &stop);
        self.take(dim, &positions)
    }

    /// Selects labels along a label coordinate in the requested order.
    pub fn select_labels(&self, dim: &str, labels: &[String]) -> Result<GridArray, ClimateError> {
        let axis = self.require_dim(dim)?;
        let CoordValues::Label(values) = &self.coords[axis] else {
            return Err(ClimateError::Selection(format!(
                "{dim} is a {} coordinate, expected label",
                self.coords[axis].kind()
            )));
        };
        let mut positions = Vec::new();
        for label in labels {
            let matches = values
                .iter()
                .enumerate()
                .filter(|(_, value)| *value == label)
                .map(|(i, _)| i)
                .collect::<Vec<_>>();
            if matches.is_empty() {
                return Err(ClimateError::Selection(format!("{dim}={label} not found")));
            }
            positions.extend(matches);
        }
        self.take(dim, &positions)
    }

    /// Prepends a length-1 axis labeled `label`.
    pub fn expand_dim(self, dim: &str, label: &str) -> Result<GridArray, ClimateError> {
        if self.dim_index(dim).is_some() {
            return Err(ClimateError::InvalidGrid(format!(
                "{}: dimension {dim} already present",
                self.name
            )));
        }
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(dim.to_string());
        dims.extend(self.dims);
        let mut coords = Vec::with_capacity(self.coords.len() + 1);
        coords.push(CoordValues::Label(vec![label.to_string()]));
        coords.extend(self.coords);
        Ok(GridArray {
            name: self.name,
            dims,
            coords,
            data: self.data.insert_axis(Axis(0)),
            attrs: self.attrs,
        })
    }

    /// Row-per-coordinate-combination projection, in row-major order.
    pub fn to_table(&self) -> Table {
        let mut columns = self.dims.clone();
        columns.push(self.name.clone());
        let rows = self
            .data
            .indexed_iter()
            .map(|(index, value)| {
                let labels = index
                    .as_array_view()
                    .iter()
                    .zip(&self.coords)
                    .filter_map(|(&i, coord)| coord.label(i))
                    .collect();
                TableRow {
                    labels,
                    value: *value,
                }
            })
            .collect();
        Table { columns, rows }
    }

    fn require_dim(&self, dim: &str) -> Result<usize, ClimateError> {
        self.dim_index(dim).ok_or_else(|| {
            ClimateError::Selection(format!("{} has no dimension {dim}", self.name))
        })
    }
}

fn slice_positions<T: PartialOrd>(values: &[T], start: &T, stop: &T) -> Vec<usize> {
    let descending = match (values.first(), values.last()) {
        (Some(first), Some(last)) => first > last,
        _ => false,
    };
    let (low, high, wants_descending) = if start <= stop {
        (start, stop, false)
    } else {
        (stop, start, true)
    };
    if values.len() > 1 && descending != wants_descending && start != stop {
        return Vec::new();
    }
    values
        .iter()
        .enumerate()
        .filter(|(_, value)| *value >= low && *value <= high)
        .map(|(i, _)| i)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

#[derive(Debug, Clone)]
pub struct TableRow {
    pub labels: Vec<Label>,
    pub value: f64,
}

/// All variables opened from one resource.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub variables: BTreeMap<String, GridArray>,
    pub attrs: Attrs,
}

impl Dataset {
    pub fn variable(&self, name: &str) -> Option<&GridArray> {
        self.variables.get(name)
    }

    pub fn take_variable(mut self, name: &str) -> Option<GridArray> {
        let attrs = std::mem::take(&mut self.attrs);
        self.variables.remove(name).map(|array| {
            let mut merged = attrs;
            merged.extend(array.attrs().clone());
            array.with_attrs(merged)
        })
    }

    /// Drops every variable whose name is not listed.
    pub fn retain(&mut self, keep: &[&str]) {
        self.variables.retain(|name, _| keep.contains(&name.as_str()));
    }

    pub fn from_document(document: GridDocument) -> Result<Self, ClimateError> {
        let mut variables = BTreeMap::new();
        for (name, variable) in document.variables {
            let mut axes = Vec::with_capacity(variable.dims.len());
            for dim in &variable.dims {
                let coord = document.coords.get(dim).ok_or_else(|| {
                    ClimateError::Decode(format!("{name}: missing coordinate {dim}"))
                })?;
                axes.push((dim.as_str(), coord.clone()));
            }
            let values = variable
                .data
                .into_iter()
                .map(|value| value.unwrap_or(f64::NAN))
                .collect();
            let array = GridArray::from_vec(name.clone(), axes, values)
                .map_err(|err| ClimateError::Decode(err.to_string()))?
                .with_attrs(variable.attrs);
            variables.insert(name, array);
        }
        Ok(Self {
            variables,
            attrs: document.attrs,
        })
    }

    pub fn to_document(&self) -> Result<GridDocument, ClimateError> {
        let mut coords = BTreeMap::<String, CoordValues>::new();
        let mut variables = BTreeMap::new();
        for (name, array) in &self.variables {
            for (dim, coord) in array.dims().iter().zip(array.coords()) {
                match coords.get(dim) {
                    Some(existing) if existing != coord => {
                        return Err(ClimateError::InvalidGrid(format!(
                            "coordinate {dim} differs between variables"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        coords.insert(dim.clone(), coord.clone());
                    }
                }
            }
            variables.insert(
                name.clone(),
                VariableDocument {
                    dims: array.dims().to_vec(),
                    data: array
                        .data()
                        .iter()
                        .map(|value| (!value.is_nan()).then_some(*value))
                        .collect(),
                    attrs: array.attrs().clone(),
                },
            );
        }
        Ok(GridDocument {
            attrs: self.attrs.clone(),
            coords,
            variables,
        })
    }
}

impl From<GridArray> for Dataset {
    fn from(array: GridArray) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert(array.name().to_string(), array);
        Self {
            variables,
            attrs: Attrs::new(),
        }
    }
}

/// JSON wire form of a [`Dataset`]; missing values are encoded as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridDocument {
    #[serde(default)]
    pub attrs: Attrs,
    pub coords: BTreeMap<String, CoordValues>,
    pub variables: BTreeMap<String, VariableDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDocument {
    pub dims: Vec<String>,
    pub data: Vec<Option<f64>>,
    #[serde(default)]
    pub attrs: Attrs,
}
