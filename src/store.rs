use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::error::ClimateError;

/// Local cache for archive downloads and retrieved files.
#[derive(Debug, Clone)]
pub struct Store {
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, ClimateError> {
        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("climate-eed")).ok()
            })
            .ok_or_else(|| {
                ClimateError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { cache_root })
    }

    pub fn new_with_root(cache_root: Utf8PathBuf) -> Self {
        Self { cache_root }
    }

    /// Local mirror of `{category}/{issue_date}` on the archive feed.
    pub fn archive_dir(&self, category: &str, issue_date: &str) -> Utf8PathBuf {
        self.cache_root.join(category).join(issue_date)
    }

    pub fn archive_file_path(&self, category: &str, issue_date: &str, file: &str) -> Utf8PathBuf {
        self.archive_dir(category, issue_date).join(file)
    }

    pub fn retrieval_path(&self, dataset: &str, file: &str) -> Utf8PathBuf {
        self.cache_root.join("cds").join(dataset).join(file)
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), ClimateError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| ClimateError::Filesystem(err.to_string()))
    }

    pub fn exists(path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ClimateError> {
        let parent = path
            .parent()
            .ok_or_else(|| ClimateError::Filesystem("invalid destination path".to_string()))?;
        Self::ensure_dir(parent)?;
        let temp = tempfile::Builder::new()
            .prefix("climate-eed-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| ClimateError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Runs `write` against a temp file next to `path`, then moves it into place.
    pub fn write_with<F>(path: &Utf8Path, write: F) -> Result<(), ClimateError>
    where
        F: FnOnce(&mut fs::File) -> Result<(), ClimateError>,
    {
        let parent = path
            .parent()
            .ok_or_else(|| ClimateError::Filesystem("invalid destination path".to_string()))?;
        Self::ensure_dir(parent)?;
        let mut temp = tempfile::Builder::new()
            .prefix("climate-eed-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
        write(temp.as_file_mut())?;
        temp.persist(path.as_std_path())
            .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Like [`Store::write_with`] for writers that need a path rather than a handle.
    pub fn write_at<F>(path: &Utf8Path, write: F) -> Result<(), ClimateError>
    where
        F: FnOnce(&Path) -> Result<(), ClimateError>,
    {
        let parent = path
            .parent()
            .ok_or_else(|| ClimateError::Filesystem("invalid destination path".to_string()))?;
        Self::ensure_dir(parent)?;
        let temp = tempfile::Builder::new()
            .prefix("climate-eed-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
        write(temp.path())?;
        temp.persist(path.as_std_path())
            .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
