use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::ClimateError;
use crate::grid::{Dataset, GridDocument};
use crate::nc;

/// Opens a resource reference (URL or local path) as a gridded dataset.
pub trait ResourceOpener: Send + Sync {
    fn open(&self, href: &str) -> Result<Dataset, ClimateError>;
}

/// Reads NetCDF files or gridded JSON documents over HTTP(S) or from the
/// local filesystem. The format is sniffed from the leading bytes, so cached
/// downloads open regardless of their extension.
#[derive(Clone)]
pub struct DocumentOpener {
    client: Client,
}

impl DocumentOpener {
    pub fn new() -> Result<Self, ClimateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("climate-eed/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ClimateError::ResourceHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| ClimateError::ResourceHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn read_remote(&self, href: &str) -> Result<Vec<u8>, ClimateError> {
        let response = self
            .client
            .get(href)
            .send()
            .map_err(|err| ClimateError::ResourceHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "resource request failed".to_string());
            return Err(ClimateError::ResourceStatus { status, message });
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| ClimateError::ResourceHttp(err.to_string()))
    }
}

impl ResourceOpener for DocumentOpener {
    fn open(&self, href: &str) -> Result<Dataset, ClimateError> {
        if href.starts_with("https://") || href.starts_with("http://") {
            let bytes = self.read_remote(href)?;
            if nc::is_netcdf(&bytes) {
                return nc::read_bytes(&bytes);
            }
            return decode_document(&bytes);
        }
        let path = Path::new(href.strip_prefix("file://").unwrap_or(href));
        if nc::is_netcdf(&read_signature(path)?) {
            return nc::read_dataset(path);
        }
        let bytes = fs::read(path)
            .map_err(|err| ClimateError::Filesystem(format!("read {}: {err}", path.display())))?;
        decode_document(&bytes)
    }
}

fn read_signature(path: &Path) -> Result<Vec<u8>, ClimateError> {
    let file = File::open(path)
        .map_err(|err| ClimateError::Filesystem(format!("read {}: {err}", path.display())))?;
    let mut signature = Vec::with_capacity(8);
    file.take(8)
        .read_to_end(&mut signature)
        .map_err(|err| ClimateError::Filesystem(format!("read {}: {err}", path.display())))?;
    Ok(signature)
}

pub fn decode_document(bytes: &[u8]) -> Result<Dataset, ClimateError> {
    let document: GridDocument =
        serde_json::from_slice(bytes).map_err(|err| ClimateError::Decode(err.to_string()))?;
    Dataset::from_document(document)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::grid::{CoordValues, GridArray};

    #[test]
    fn opens_local_document() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("COUT_EC-Earth.json");
        fs::write(
            &path,
            r#"{
                "coords": {
                    "time": {"kind": "time", "values": ["2024-04-01T00:00:00", "2024-04-02T00:00:00"]},
                    "id": {"kind": "label", "values": ["301515"]}
                },
                "variables": {
                    "COUT": {"dims": ["time", "id"], "data": [1.0, null]}
                }
            }"#,
        )
        .unwrap();

        let opener = DocumentOpener::new().unwrap();
        let dataset = opener
            .open(&format!("file://{}", path.display()))
            .unwrap();
        let cout = dataset.variable("COUT").unwrap();
        assert_eq!(cout.shape(), &[2, 1]);
        assert!(cout.data()[[1, 0]].is_nan());
    }

    #[test]
    fn undecodable_bytes_are_decode_errors() {
        assert_matches!(decode_document(b"not a grid"), Err(ClimateError::Decode(_)));
    }

    #[test]
    fn opens_netcdf_without_extension() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("seasonal.download");
        let array = GridArray::from_vec(
            "tp",
            vec![("time", CoordValues::Float(vec![0.0, 6.0]))],
            vec![0.25, f64::NAN],
        )
        .unwrap();
        nc::write_array(&array, &path).unwrap();

        let opener = DocumentOpener::new().unwrap();
        let dataset = opener.open(path.to_str().unwrap()).unwrap();
        let tp = dataset.variable("tp").unwrap();
        assert_eq!(tp.coord("time"), Some(&CoordValues::Float(vec![0.0, 6.0])));
        assert_eq!(tp.data()[[0]], 0.25);
        assert!(tp.data()[[1]].is_nan());
    }

    #[test]
    fn missing_local_file_is_filesystem_error() {
        let opener = DocumentOpener::new().unwrap();
        assert_matches!(
            opener.open("/nonexistent/climate-eed/COUT.nc"),
            Err(ClimateError::Filesystem(_))
        );
    }
}
