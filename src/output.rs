use std::fs::File;
use std::io::{self, BufWriter, Write};

use camino::Utf8Path;
use serde::Serialize;

use crate::app::{
    FetchSummary, ProgressEvent, ProgressSink, RepositoriesResult, RetrieveResult,
    VariablesResult,
};
use crate::domain::OutputFormat;
use crate::error::ClimateError;
use crate::grid::{Dataset, GridArray, Table};
use crate::nc;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Writes `array` to `path` in the given format, replacing the file atomically.
pub fn write_output(
    array: &GridArray,
    path: &Utf8Path,
    format: OutputFormat,
) -> Result<(), ClimateError> {
    match format {
        OutputFormat::Csv => Store::write_with(path, |file| write_csv(&array.to_table(), file)),
        OutputFormat::Json => Store::write_with(path, |file| write_document(array, file)),
        OutputFormat::Netcdf => Store::write_at(path, |temp| nc::write_array(array, temp)),
    }
}

pub fn write_csv<W: Write>(table: &Table, writer: W) -> Result<(), ClimateError> {
    let mut out = BufWriter::new(writer);
    let header = table
        .columns
        .iter()
        .map(|column| csv_field(column))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(out, "{header}").map_err(fs_error)?;
    for row in &table.rows {
        for label in &row.labels {
            write!(out, "{},", csv_field(&label.to_string())).map_err(fs_error)?;
        }
        if row.value.is_nan() {
            writeln!(out).map_err(fs_error)?;
        } else {
            writeln!(out, "{}", row.value).map_err(fs_error)?;
        }
    }
    out.flush().map_err(fs_error)
}

fn write_document(array: &GridArray, file: &mut File) -> Result<(), ClimateError> {
    let document = Dataset::from(array.clone()).to_document()?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, &document)
        .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
    out.flush().map_err(fs_error)
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn fs_error(err: io::Error) -> ClimateError {
    ClimateError::Filesystem(err.to_string())
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(summary: &FetchSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_variables(result: &VariablesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_repositories(result: &RepositoriesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_retrieve(result: &RetrieveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr for interactive runs.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let line = match event.elapsed {
            Some(elapsed) => format!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => event.message,
        };
        eprintln!("{line}");
    }
}
