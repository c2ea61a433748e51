//! Telemetry output sinks.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;

/// Destination for one drive's decoded telemetry.
///
/// One sink per drive, opened before the poll workers start and flushed on
/// every exit path of the drain loop.
#[async_trait]
pub trait TelemetrySink: Send {
    /// The `time [s],<channels...>` header line.
    async fn write_header(&mut self, header: &str) -> Result<()>;

    /// One decoded sample row, timestamp first.
    async fn write_row(&mut self, row: &[f64]) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;
}

/// CSV file sink, one file per drive.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Create the output file up front, so a bad path fails before any
    /// worker starts.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create telemetry file at {:?}", path))?;
        info!("Recording to '{}'", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: csv::Writer::from_writer(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySink for CsvSink {
    async fn write_header(&mut self, header: &str) -> Result<()> {
        self.writer
            .write_record(header.split(','))
            .context("Failed to write telemetry header")
    }

    async fn write_row(&mut self, row: &[f64]) -> Result<()> {
        self.writer
            .write_record(row.iter().map(|v| v.to_string()))
            .context("Failed to write telemetry row")
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush telemetry file")
    }
}

/// In-memory sink, for tests and for callers that post-process rows.
#[derive(Default)]
pub struct MemorySink {
    pub header: Option<String>,
    pub rows: Vec<Vec<f64>>,
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn write_header(&mut self, header: &str) -> Result<()> {
        self.header = Some(header.to_string());
        Ok(())
    }

    async fn write_row(&mut self, row: &[f64]) -> Result<()> {
        self.rows.push(row.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// `<prefix>_<drive>_<frequency>hz.csv`
pub fn telemetry_file_name(prefix: &str, drive: &str, frequency_hz: f64) -> String {
    format!("{}_{}_{}hz.csv", prefix, drive, frequency_hz)
}

/// `fault_<timestamp>_<code>.csv`, one file per captured fault event.
pub fn fault_log_file_name(fault_code: &str, observed_at: &DateTime<Utc>) -> String {
    let code = fault_code.replace(',', "-");
    format!("fault_{}_{}.csv", observed_at.format("%Y%m%d_%H%M%S"), code)
}
