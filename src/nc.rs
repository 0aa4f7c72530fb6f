use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use ndarray::{ArrayD, IxDyn};
use netcdf::{AttributeValue, Variable};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ClimateError;
use crate::grid::{Attrs, CoordValues, Dataset, GridArray};

const TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00";

/// Attributes consumed while unpacking values; not carried into the grid.
const PACKING_ATTRS: [&str; 4] = ["_FillValue", "missing_value", "scale_factor", "add_offset"];

/// True when `bytes` start with a classic, 64-bit offset, CDF-5 or HDF5 signature.
pub fn is_netcdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"CDF\x01")
        || bytes.starts_with(b"CDF\x02")
        || bytes.starts_with(b"CDF\x05")
        || bytes.starts_with(b"\x89HDF\r\n\x1a\n")
}

/// Spools downloaded bytes to a temp file; the C library only reads from paths.
pub fn read_bytes(bytes: &[u8]) -> Result<Dataset, ClimateError> {
    let mut temp = tempfile::Builder::new()
        .prefix("climate-eed-")
        .suffix(".nc")
        .tempfile()
        .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
    temp.write_all(bytes)
        .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
    read_dataset(temp.path())
}

/// Opens a NetCDF file and decodes every numeric variable onto its coordinates.
///
/// Coordinate variables (1-d, named like their dimension) become axis labels;
/// a `units = "<unit> since <date>"` attribute turns them into timestamps.
/// Dimensions without a coordinate variable are labeled by position.
/// `_FillValue`/`missing_value` cells become NaN before `scale_factor` and
/// `add_offset` are applied.
pub fn read_dataset(path: &Path) -> Result<Dataset, ClimateError> {
    let file = netcdf::open(path)
        .map_err(|err| ClimateError::Decode(format!("{}: {err}", path.display())))?;

    let mut coords: BTreeMap<String, CoordValues> = BTreeMap::new();
    for dim in file.dimensions() {
        let name = dim.name();
        let coord = match file.variable(&name) {
            Some(var) if is_coordinate(&var, &name) => read_coord(&var, dim.len()),
            _ => positions(dim.len()),
        };
        coords.insert(name, coord);
    }

    let mut variables = BTreeMap::new();
    for var in file.variables() {
        let name = var.name();
        if is_coordinate(&var, &name) {
            continue;
        }
        let Some(values) = read_numeric(&var) else {
            debug!(variable = %name, "skipping non-numeric variable");
            continue;
        };
        let dims: Vec<String> = var.dimensions().iter().map(|dim| dim.name()).collect();
        let mut axes = Vec::with_capacity(dims.len());
        for dim in &dims {
            let coord = coords.get(dim).cloned().ok_or_else(|| {
                ClimateError::Decode(format!("{name}: dimension {dim} not found"))
            })?;
            axes.push(coord);
        }
        let shape: Vec<usize> = axes.iter().map(CoordValues::len).collect();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), unpack(&var, values))
            .map_err(|err| ClimateError::Decode(format!("{name}: {err}")))?;
        let array = GridArray::new(name.clone(), dims, axes, data)?.with_attrs(variable_attrs(&var));
        variables.insert(name, array);
    }

    let mut attrs = Attrs::new();
    for attr in file.attributes() {
        if let Some(value) = attr.value().ok().and_then(attr_json) {
            attrs.insert(attr.name().to_string(), value);
        }
    }
    Ok(Dataset { variables, attrs })
}

/// Writes one array with its coordinates as a NetCDF-4 file.
pub fn write_array(array: &GridArray, path: &Path) -> Result<(), ClimateError> {
    let mut file = netcdf::create(path).map_err(encode_error)?;
    for (dim, coord) in array.dims().iter().zip(array.coords()) {
        file.add_dimension(dim, coord.len()).map_err(encode_error)?;
    }
    for (dim, coord) in array.dims().iter().zip(array.coords()) {
        match coord {
            CoordValues::Float(values) => {
                let mut var = file.add_variable::<f64>(dim, &[dim.as_str()]).map_err(encode_error)?;
                var.put_values(values.as_slice(), ..).map_err(encode_error)?;
            }
            CoordValues::Time(values) => {
                let seconds: Vec<f64> = values
                    .iter()
                    .map(|time| time.and_utc().timestamp() as f64)
                    .collect();
                let mut var = file.add_variable::<f64>(dim, &[dim.as_str()]).map_err(encode_error)?;
                var.put_attribute("units", TIME_UNITS).map_err(encode_error)?;
                var.put_attribute("calendar", "proleptic_gregorian")
                    .map_err(encode_error)?;
                var.put_values(seconds.as_slice(), ..).map_err(encode_error)?;
            }
            CoordValues::Label(values) => {
                let mut var = file.add_string_variable(dim, &[dim.as_str()]).map_err(encode_error)?;
                for (index, label) in values.iter().enumerate() {
                    var.put_string(label, [index]).map_err(encode_error)?;
                }
            }
        }
    }

    let dims: Vec<&str> = array.dims().iter().map(String::as_str).collect();
    let mut var = file
        .add_variable::<f64>(array.name(), &dims)
        .map_err(encode_error)?;
    var.put_attribute("_FillValue", f64::NAN).map_err(encode_error)?;
    for (name, value) in array.attrs() {
        if PACKING_ATTRS.contains(&name.as_str()) {
            continue;
        }
        match value {
            Value::String(text) => var.put_attribute(name, text.as_str()),
            Value::Number(number) => match number.as_f64() {
                Some(number) => var.put_attribute(name, number),
                None => continue,
            },
            Value::Null => continue,
            other => var.put_attribute(name, other.to_string().as_str()),
        }
        .map_err(encode_error)?;
    }
    let values: Vec<f64> = array.data().iter().copied().collect();
    var.put_values(values.as_slice(), ..).map_err(encode_error)?;
    Ok(())
}

fn encode_error(err: netcdf::Error) -> ClimateError {
    ClimateError::Encode(err.to_string())
}

fn is_coordinate(var: &Variable, name: &str) -> bool {
    let dims = var.dimensions();
    dims.len() == 1 && dims[0].name() == name
}

fn positions(len: usize) -> CoordValues {
    CoordValues::Float((0..len).map(|index| index as f64).collect())
}

fn read_coord(var: &Variable, len: usize) -> CoordValues {
    if let Some(values) = read_numeric(var) {
        return match string_attr(var, "units").and_then(|units| decode_times(var, &units, &values)) {
            Some(times) => CoordValues::Time(times),
            None => CoordValues::Float(values),
        };
    }
    let labels: Result<Vec<String>, _> = (0..len).map(|index| var.get_string([index])).collect();
    match labels {
        Ok(labels) => CoordValues::Label(labels),
        Err(err) => {
            debug!(coordinate = %var.name(), error = %err, "unreadable coordinate, using positions");
            positions(len)
        }
    }
}

/// Reads any numeric storage type as f64.
fn read_numeric(var: &Variable) -> Option<Vec<f64>> {
    if let Ok(values) = var.get_values::<f64, _>(..) {
        return Some(values);
    }
    if let Ok(values) = var.get_values::<f32, _>(..) {
        return Some(values.into_iter().map(f64::from).collect());
    }
    if let Ok(values) = var.get_values::<i32, _>(..) {
        return Some(values.into_iter().map(f64::from).collect());
    }
    if let Ok(values) = var.get_values::<i64, _>(..) {
        return Some(values.into_iter().map(|value| value as f64).collect());
    }
    if let Ok(values) = var.get_values::<i16, _>(..) {
        return Some(values.into_iter().map(f64::from).collect());
    }
    if let Ok(values) = var.get_values::<i8, _>(..) {
        return Some(values.into_iter().map(f64::from).collect());
    }
    if let Ok(values) = var.get_values::<u32, _>(..) {
        return Some(values.into_iter().map(f64::from).collect());
    }
    if let Ok(values) = var.get_values::<u16, _>(..) {
        return Some(values.into_iter().map(f64::from).collect());
    }
    None
}

fn unpack(var: &Variable, values: Vec<f64>) -> Vec<f64> {
    let fill = f64_attr(var, "_FillValue");
    let missing = f64_attr(var, "missing_value");
    let scale = f64_attr(var, "scale_factor").unwrap_or(1.0);
    let offset = f64_attr(var, "add_offset").unwrap_or(0.0);
    values
        .into_iter()
        .map(|value| {
            if Some(value) == fill || Some(value) == missing {
                f64::NAN
            } else {
                value * scale + offset
            }
        })
        .collect()
}

fn f64_attr(var: &Variable, name: &str) -> Option<f64> {
    let attr_value = var.attribute_value(name)?.ok()?;
    f64::try_from(attr_value).ok()
}

fn string_attr(var: &Variable, name: &str) -> Option<String> {
    match var.attribute_value(name)?.ok()? {
        AttributeValue::Str(text) => Some(text),
        _ => None,
    }
}

fn variable_attrs(var: &Variable) -> Attrs {
    let mut attrs = Attrs::new();
    for attr in var.attributes() {
        if PACKING_ATTRS.contains(&attr.name()) {
            continue;
        }
        if let Some(value) = attr.value().ok().and_then(attr_json) {
            attrs.insert(attr.name().to_string(), value);
        }
    }
    attrs
}

fn attr_json(value: AttributeValue) -> Option<Value> {
    match value {
        AttributeValue::Str(text) => Some(Value::String(text)),
        AttributeValue::Strs(texts) => Some(json!(texts)),
        AttributeValue::Doubles(values) => Some(json!(values)),
        AttributeValue::Floats(values) => Some(json!(values)),
        AttributeValue::Ints(values) => Some(json!(values)),
        AttributeValue::Shorts(values) => Some(json!(values)),
        other => f64::try_from(other).ok().map(|value| json!(value)),
    }
}

/// Decodes CF `"<unit> since <reference>"` offsets; `None` leaves the axis numeric.
fn decode_times(var: &Variable, units: &str, values: &[f64]) -> Option<Vec<NaiveDateTime>> {
    if let Some(calendar) = string_attr(var, "calendar") {
        let calendar = calendar.to_ascii_lowercase();
        if !matches!(calendar.as_str(), "standard" | "gregorian" | "proleptic_gregorian") {
            debug!(coordinate = %var.name(), %calendar, "non-gregorian calendar kept numeric");
            return None;
        }
    }
    let (unit, reference) = units.split_once(" since ")?;
    let unit_seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
        "minutes" | "minute" | "mins" | "min" => 60.0,
        "hours" | "hour" | "hrs" | "hr" | "h" => 3_600.0,
        "days" | "day" | "d" => 86_400.0,
        _ => return None,
    };
    let reference = parse_reference(reference)?;
    values
        .iter()
        .map(|value| {
            if !value.is_finite() {
                return None;
            }
            let millis = (value * unit_seconds * 1_000.0).round() as i64;
            reference.checked_add_signed(TimeDelta::milliseconds(millis))
        })
        .collect()
}

fn parse_reference(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches("UTC").trim_end_matches('Z').trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(time) = NaiveDateTime::parse_from_str(text, format) {
            return Some(time);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 4, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Basin forecast file shaped like the archive feed: integer ids, packed
    /// float discharge with a fill value.
    fn write_forecast(path: &Path) {
        let mut file = netcdf::create(path).unwrap();
        file.add_dimension("time", 3).unwrap();
        file.add_dimension("id", 2).unwrap();
        file.add_attribute("institution", "SMHI").unwrap();

        let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
        time.put_attribute("units", "days since 2024-04-01").unwrap();
        time.put_values(&[0.0, 1.0, 2.0], ..).unwrap();

        let mut id = file.add_variable::<i32>("id", &["id"]).unwrap();
        id.put_values(&[301515, 301516], ..).unwrap();

        let mut cout = file.add_variable::<f32>("COUT", &["time", "id"]).unwrap();
        cout.put_attribute("_FillValue", -9999.0f32).unwrap();
        cout.put_attribute("scale_factor", 0.5f32).unwrap();
        cout.put_attribute("units", "m3/s").unwrap();
        cout.put_values(&[2.0f32, 4.0, -9999.0, 6.0, 8.0, 10.0], ..)
            .unwrap();
    }

    #[test]
    fn reads_forecast_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("georgia_COUT_EC-Earth.nc");
        write_forecast(&path);

        let dataset = read_dataset(&path).unwrap();
        assert_eq!(dataset.attrs.get("institution"), Some(&json!("SMHI")));

        let cout = dataset.variable("COUT").unwrap();
        assert_eq!(cout.dims(), &["time".to_string(), "id".to_string()]);
        assert_eq!(cout.shape(), &[3, 2]);
        assert_eq!(
            cout.coord("time"),
            Some(&CoordValues::Time(vec![day(1), day(2), day(3)]))
        );
        assert_eq!(
            cout.coord("id"),
            Some(&CoordValues::Float(vec![301515.0, 301516.0]))
        );
        assert_eq!(cout.data()[[0, 0]], 1.0);
        assert_eq!(cout.data()[[0, 1]], 2.0);
        assert!(cout.data()[[1, 0]].is_nan());
        assert_eq!(cout.data()[[2, 1]], 5.0);
        assert_eq!(cout.attrs().get("units"), Some(&json!("m3/s")));
        assert!(!cout.attrs().contains_key("_FillValue"));
        assert!(dataset.variable("time").is_none());
    }

    #[test]
    fn written_arrays_reopen_with_labels_and_times() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("merged.nc");
        let array = GridArray::from_vec(
            "COUT",
            vec![
                ("model", CoordValues::Label(vec!["EC-Earth".into(), "ECMWF".into()])),
                ("time", CoordValues::Time(vec![day(1), day(2)])),
            ],
            vec![1.0, f64::NAN, 3.0, 4.0],
        )
        .unwrap();

        write_array(&array, &path).unwrap();
        let reopened = read_dataset(&path).unwrap().take_variable("COUT").unwrap();
        assert_eq!(reopened.coords(), array.coords());
        assert!(reopened.data()[[0, 1]].is_nan());
        assert_eq!(reopened.data()[[1, 1]], 4.0);
    }

    #[test]
    fn sniffs_signatures() {
        assert!(is_netcdf(b"CDF\x01rest"));
        assert!(is_netcdf(b"\x89HDF\r\n\x1a\nrest"));
        assert!(!is_netcdf(b"{\"coords\": {}}"));
        assert!(!is_netcdf(b"CD"));
    }

    #[test]
    fn reference_dates_accept_common_layouts() {
        assert_eq!(parse_reference("1970-01-01 00:00:00"), Some(day(1) - TimeDelta::days(19814)));
        assert_eq!(parse_reference("2024-04-01T00:00:00Z"), Some(day(1)));
        assert_eq!(parse_reference(" 2024-04-01 "), Some(day(1)));
        assert_matches!(parse_reference("yesterday"), None);
    }

    #[test]
    fn truncated_files_are_decode_errors() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.nc");
        std::fs::write(&path, b"CDF\x01").unwrap();
        assert_matches!(read_dataset(&path), Err(ClimateError::Decode(_)));
    }
}
