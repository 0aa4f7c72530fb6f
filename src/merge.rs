//! Combines per-item partial arrays into one output array.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use tracing::debug;

use crate::domain::{BoundingBox, MergeStrategy, TimeRange};
use crate::error::ClimateError;
use crate::fetch::{MODEL_DIM, Outcome, PartialResult};
use crate::grid::{Attrs, CoordValues, GridArray};

pub const TIME_DIM: &str = "time";
pub const LAT_DIM: &str = "lat";
pub const LON_DIM: &str = "lon";

/// Subsetting applied once after model stacking.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub bbox: Option<BoundingBox>,
    pub time_range: Option<TimeRange>,
    pub models: Vec<String>,
}

pub struct Merger;

impl Merger {
    /// Failures and missing assets are skipped; an outcome list with no
    /// fetched array is an [`ClimateError::EmptyResult`].
    pub fn merge(
        outcomes: &[Outcome],
        strategy: MergeStrategy,
        selection: &Selection,
    ) -> Result<GridArray, ClimateError> {
        let parts = outcomes
            .iter()
            .filter_map(Outcome::as_fetched)
            .collect::<Vec<_>>();
        if parts.is_empty() {
            return Err(ClimateError::EmptyResult);
        }
        debug!(
            %strategy,
            parts = parts.len(),
            skipped = outcomes.len() - parts.len(),
            "merging"
        );
        match strategy {
            MergeStrategy::TimeConcat => concat_time(&parts),
            MergeStrategy::ModelStack => select(stack_models(&parts)?, selection),
            MergeStrategy::OuterMerge => outer_merge(&parts),
        }
    }
}

fn concat_time(parts: &[&PartialResult]) -> Result<GridArray, ClimateError> {
    let first = &parts[0].array;
    let axis = first
        .dim_index(TIME_DIM)
        .ok_or_else(|| shape_error(&parts[..1], format!("{} has no {TIME_DIM} axis", first.name())))?;

    for part in &parts[1..] {
        let array = &part.array;
        if array.dims() != first.dims() {
            return Err(shape_error(
                &[parts[0], *part],
                format!("axes {:?} differ from {:?}", array.dims(), first.dims()),
            ));
        }
        for (index, dim) in first.dims().iter().enumerate() {
            if index != axis && array.coords()[index] != first.coords()[index] {
                return Err(shape_error(
                    &[parts[0], *part],
                    format!("{dim} coordinates differ"),
                ));
            }
        }
    }

    let views = parts
        .iter()
        .map(|part| part.array.data().view())
        .collect::<Vec<_>>();
    let data = ndarray::concatenate(Axis(axis), &views)
        .map_err(|err| shape_error(parts, err.to_string()))?;
    let time_parts = parts
        .iter()
        .map(|part| &part.array.coords()[axis])
        .collect::<Vec<_>>();
    let time = CoordValues::concat(&time_parts)
        .ok_or_else(|| shape_error(parts, format!("{TIME_DIM} coordinate kinds differ")))?;

    let mut coords = first.coords().to_vec();
    coords[axis] = time;
    Ok(
        GridArray::new(first.name(), first.dims().to_vec(), coords, data)?
            .with_attrs(first.attrs().clone()),
    )
}

fn stack_models(parts: &[&PartialResult]) -> Result<GridArray, ClimateError> {
    let first = &parts[0].array;
    if first.dim_index(MODEL_DIM).is_some() {
        return Err(shape_error(
            &parts[..1],
            format!("{} already has a {MODEL_DIM} axis", first.name()),
        ));
    }
    let (union, positions) = align(parts)?;

    let mut shape = vec![parts.len()];
    shape.extend(union.iter().map(CoordValues::len));
    let mut data = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
    let mut target = vec![0usize; shape.len()];
    for (k, (part, mapping)) in parts.iter().zip(&positions).enumerate() {
        target[0] = k;
        for (index, value) in part.array.data().indexed_iter() {
            for (axis, &i) in index.slice().iter().enumerate() {
                target[axis + 1] = mapping[axis][i];
            }
            data[IxDyn(&target)] = *value;
        }
    }

    let labels = parts
        .iter()
        .map(|part| part.model.clone().unwrap_or_else(|| part.source_id.clone()))
        .collect();
    let mut dims = vec![MODEL_DIM.to_string()];
    dims.extend(first.dims().iter().cloned());
    let mut coords = vec![CoordValues::Label(labels)];
    coords.extend(union);

    let attrs = drop_conflicts(parts.iter().map(|part| part.array.attrs()));
    Ok(GridArray::new(first.name(), dims, coords, data)?.with_attrs(attrs))
}

fn outer_merge(parts: &[&PartialResult]) -> Result<GridArray, ClimateError> {
    let first = &parts[0].array;
    let (union, positions) = align(parts)?;

    let shape = union.iter().map(CoordValues::len).collect::<Vec<_>>();
    let mut data = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
    let mut owner = ArrayD::from_elem(IxDyn(&shape), usize::MAX);
    let mut target = vec![0usize; shape.len()];
    for (k, (part, mapping)) in parts.iter().zip(&positions).enumerate() {
        for (index, value) in part.array.data().indexed_iter() {
            if value.is_nan() {
                continue;
            }
            for (axis, &i) in index.slice().iter().enumerate() {
                target[axis] = mapping[axis][i];
            }
            let cell = IxDyn(&target);
            let existing = data[cell.clone()];
            if !existing.is_nan() && existing != *value {
                let earlier = parts[owner[cell.clone()]];
                return Err(shape_error(
                    &[earlier, *part],
                    format!("conflicting values {existing} and {value} at {target:?}"),
                ));
            }
            data[cell.clone()] = *value;
            owner[cell] = k;
        }
    }

    Ok(
        GridArray::new(first.name(), first.dims().to_vec(), union, data)?
            .with_attrs(first.attrs().clone()),
    )
}

/// Unions every axis across `parts` and maps each part's positions into it.
///
/// All parts must carry the same axes in the same order.
fn align(
    parts: &[&PartialResult],
) -> Result<(Vec<CoordValues>, Vec<Vec<Vec<usize>>>), ClimateError> {
    let first = &parts[0].array;
    for part in &parts[1..] {
        if part.array.dims() != first.dims() {
            return Err(shape_error(
                &[parts[0], *part],
                format!("axes {:?} differ from {:?}", part.array.dims(), first.dims()),
            ));
        }
    }

    let mut union = Vec::with_capacity(first.dims().len());
    // `None` marks an axis shared verbatim by every part, mapped by position.
    let mut lookups = Vec::with_capacity(first.dims().len());
    for (axis, dim) in first.dims().iter().enumerate() {
        let coords = parts
            .iter()
            .map(|part| &part.array.coords()[axis])
            .collect::<Vec<_>>();
        let merged = union_coord(&coords)
            .ok_or_else(|| shape_error(parts, format!("{dim} coordinate kinds differ")))?;
        if coords.iter().all(|coord| *coord == coords[0]) {
            lookups.push(None);
        } else {
            for (part, coord) in parts.iter().zip(&coords) {
                if index_of(coord).len() != coord.len() {
                    return Err(shape_error(
                        &[*part],
                        format!("repeated {dim} labels cannot be aligned"),
                    ));
                }
            }
            lookups.push(Some(index_of(&merged)));
        }
        union.push(merged);
    }

    let positions = parts
        .iter()
        .map(|part| {
            part.array
                .coords()
                .iter()
                .zip(&lookups)
                .map(|(coord, lookup)| match lookup {
                    Some(lookup) => (0..coord.len())
                        .map(|i| lookup[&key(coord, i)])
                        .collect::<Vec<_>>(),
                    None => (0..coord.len()).collect(),
                })
                .collect::<Vec<_>>()
        })
        .collect();
    Ok((union, positions))
}

/// Identical coordinates are kept as they are. Otherwise labels keep
/// first-seen order and numeric or time values are sorted ascending.
fn union_coord(coords: &[&CoordValues]) -> Option<CoordValues> {
    let first = coords.first()?;
    if coords.iter().all(|coord| coord == first) {
        return Some((*first).clone());
    }
    match first {
        CoordValues::Float(_) => {
            let mut values = Vec::new();
            for coord in coords {
                let CoordValues::Float(part) = coord else {
                    return None;
                };
                values.extend_from_slice(part);
            }
            values.sort_by(f64::total_cmp);
            values.dedup_by(|a, b| a.to_bits() == b.to_bits());
            Some(CoordValues::Float(values))
        }
        CoordValues::Time(_) => {
            let mut values = Vec::<NaiveDateTime>::new();
            for coord in coords {
                let CoordValues::Time(part) = coord else {
                    return None;
                };
                values.extend_from_slice(part);
            }
            values.sort();
            values.dedup();
            Some(CoordValues::Time(values))
        }
        CoordValues::Label(_) => {
            let mut values = Vec::<String>::new();
            for coord in coords {
                let CoordValues::Label(part) = coord else {
                    return None;
                };
                for label in part {
                    if !values.contains(label) {
                        values.push(label.clone());
                    }
                }
            }
            Some(CoordValues::Label(values))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Bits(u64),
    Time(NaiveDateTime),
    Text(String),
}

fn key(coord: &CoordValues, index: usize) -> Key {
    match coord {
        CoordValues::Float(values) => Key::Bits(values[index].to_bits()),
        CoordValues::Time(values) => Key::Time(values[index]),
        CoordValues::Label(values) => Key::Text(values[index].clone()),
    }
}

/// First position of every label; duplicates map to their first occurrence.
fn index_of(coord: &CoordValues) -> HashMap<Key, usize> {
    let mut lookup = HashMap::with_capacity(coord.len());
    for i in 0..coord.len() {
        lookup.entry(key(coord, i)).or_insert(i);
    }
    lookup
}

/// Keeps attributes on which every part that carries them agrees.
fn drop_conflicts<'a>(all: impl Iterator<Item = &'a Attrs>) -> Attrs {
    let mut merged = Attrs::new();
    let mut conflicting = Vec::new();
    for attrs in all {
        for (name, value) in attrs {
            match merged.get(name) {
                Some(existing) if existing != value => conflicting.push(name.clone()),
                Some(_) => {}
                None => {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }
    }
    for name in conflicting {
        merged.remove(&name);
    }
    merged
}

/// Post-stack subsetting; axes the array does not have are left alone.
fn select(mut array: GridArray, selection: &Selection) -> Result<GridArray, ClimateError> {
    if let Some(bbox) = selection.bbox {
        if array.dim_index(LON_DIM).is_some() {
            array = array.slice_by_value(LON_DIM, bbox.min_lon, bbox.max_lon)?;
        }
        if array.dim_index(LAT_DIM).is_some() {
            array = array.slice_by_value(LAT_DIM, bbox.min_lat, bbox.max_lat)?;
        }
    }
    if let Some(range) = selection.time_range {
        if array.dim_index(TIME_DIM).is_some() {
            array = array.slice_by_time(TIME_DIM, range.start, range.end)?;
        }
    }
    if !selection.models.is_empty() {
        array = array.select_labels(MODEL_DIM, &selection.models)?;
    }
    Ok(array)
}

fn shape_error(parts: &[&PartialResult], message: impl Into<String>) -> ClimateError {
    ClimateError::MergeShape {
        items: parts.iter().map(|part| part.source_id.clone()).collect(),
        message: message.into(),
    }
}
