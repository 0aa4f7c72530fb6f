use std::io::Read;
use std::sync::LazyLock;

use regex::Regex;
use suppaftp::FtpStream;
use suppaftp::types::FileType;
use tracing::debug;

use crate::config::ArchiveConfig;
use crate::error::ClimateError;

/// Remote file feed: directory listing plus binary download.
pub trait RemoteArchive: Send + Sync {
    fn list(&self, folder: &str) -> Result<Vec<String>, ClimateError>;
    fn download(&self, folder: &str, file: &str) -> Result<Vec<u8>, ClimateError>;
}

/// Identifies one forecast issue on the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLocation {
    pub site: String,
    pub category: String,
    pub issue_date: String,
}

impl ArchiveLocation {
    pub fn remote_folder(&self, root: &str) -> String {
        let root = root.trim_end_matches('/');
        format!("{root}/{}/{}/{}", self.site, self.category, self.issue_date)
    }
}

/// Keeps NetCDF-style forecast files, in listing order.
pub fn forecast_files(listing: &[String]) -> Vec<String> {
    listing
        .iter()
        .map(|entry| entry.rsplit('/').next().unwrap_or(entry).to_string())
        .filter(|name| name.ends_with(".nc"))
        .collect()
}

static MODEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"COUT_([^.]+)\.").unwrap());

/// `..._COUT_<model>.nc` names the model; otherwise the file stem is used.
pub fn model_from_file_name(file: &str) -> String {
    if let Some(captures) = MODEL_PATTERN.captures(file) {
        return captures[1].to_string();
    }
    file.rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file)
        .to_string()
}

/// Plain FTP feed; every call opens its own session so workers never share one.
#[derive(Debug, Clone)]
pub struct FtpArchive {
    config: ArchiveConfig,
}

impl FtpArchive {
    pub fn new(config: ArchiveConfig) -> Self {
        Self { config }
    }

    fn connect(&self, folder: &str) -> Result<FtpStream, ClimateError> {
        if self.config.host.trim().is_empty() {
            return Err(ClimateError::MissingCredentials(
                "archive host not configured (CLIMATE_EED_FTP_HOST)".to_string(),
            ));
        }
        let address = format!("{}:{}", self.config.host, self.config.port);
        let mut stream = FtpStream::connect(address.as_str())
            .map_err(|err| ClimateError::Archive(format!("connect {address}: {err}")))?;
        stream
            .login(self.config.user.as_str(), self.config.password.as_str())
            .map_err(|err| ClimateError::Archive(format!("login: {err}")))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|err| ClimateError::Archive(err.to_string()))?;
        stream
            .cwd(folder)
            .map_err(|err| ClimateError::Archive(format!("cwd {folder}: {err}")))?;
        Ok(stream)
    }
}

impl RemoteArchive for FtpArchive {
    fn list(&self, folder: &str) -> Result<Vec<String>, ClimateError> {
        let mut stream = self.connect(folder)?;
        let names = stream
            .nlst(None)
            .map_err(|err| ClimateError::Archive(format!("list {folder}: {err}")))?;
        stream.quit().ok();
        debug!(folder, entries = names.len(), "archive listing");
        Ok(names)
    }

    fn download(&self, folder: &str, file: &str) -> Result<Vec<u8>, ClimateError> {
        let mut stream = self.connect(folder)?;
        let mut cursor = stream
            .retr_as_buffer(file)
            .map_err(|err| ClimateError::Archive(format!("retrieve {file}: {err}")))?;
        stream.quit().ok();
        let mut bytes = Vec::new();
        cursor
            .read_to_end(&mut bytes)
            .map_err(|err| ClimateError::Archive(err.to_string()))?;
        Ok(bytes)
    }
}
