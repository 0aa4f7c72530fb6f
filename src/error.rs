use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ClimateError {
    #[error("invalid bounding box: {0}")]
    InvalidBbox(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    #[error("invalid output format: {0}")]
    InvalidOutputFormat(String),

    #[error("no data: every catalog item failed or lacked the requested variable")]
    EmptyResult,

    #[error("cannot merge items [{}]: {message}", items.join(", "))]
    MergeShape { items: Vec<String>, message: String },

    #[error("invalid selection: {0}")]
    Selection(String),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("resource request failed: {0}")]
    ResourceHttp(String),

    #[error("resource returned status {status}: {message}")]
    ResourceStatus { status: u16, message: String },

    #[error("failed to decode gridded data: {0}")]
    Decode(String),

    #[error("failed to write NetCDF: {0}")]
    Encode(String),

    #[error("archive transfer failed: {0}")]
    Archive(String),

    #[error("climate data store request failed: {0}")]
    CdsHttp(String),

    #[error("climate data store returned status {status}: {message}")]
    CdsStatus { status: u16, message: String },

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
