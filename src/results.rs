//! # Result Logging and Export
//!
//! Two outputs are produced for every benchmark session:
//!
//! - A human-readable statistics log ([`LogFile`]) with one line per
//!   completed run, managed by the [`StatisticsSink`]. Log files are never
//!   appended to or overwritten: if the chosen name exists, `name(1)`,
//!   `name(2)`, ... are tried until an unused name is found.
//! - An optional JSON report ([`ResultsManager`]) with every
//!   [`StatisticsRecord`] plus session metadata, written at the end of a
//!   local run series.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics::{StatisticsRecord, LOG_HEADER};

/// An exclusively created, line-oriented text log.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFile {
    /// Create `dir/name`, or the first free `dir/name(n)`.
    pub fn create_unique(dir: &Path, name: &str) -> Result<Self> {
        for attempt in 0u32.. {
            let file_name = if attempt == 0 {
                name.to_string()
            } else {
                format!("{}({})", name, attempt)
            };
            let path = dir.join(file_name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!("Created log file {:?}", path);
                    return Ok(Self {
                        path,
                        writer: BufWriter::new(file),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create log file {:?}", path))
                }
            }
        }
        anyhow::bail!("No free log file name for {:?} in {:?}", name, dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line and flush it so a crash loses nothing.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("Failed to write to {:?}", self.path))
    }
}

/// The single writer of statistics lines in a process.
///
/// The log file is created lazily on first use, so a process that never
/// completes a run leaves no empty file behind.
#[derive(Debug)]
pub struct StatisticsSink {
    dir: PathBuf,
    base_name: String,
    log: Option<LogFile>,
    echo: bool,
    records: Vec<StatisticsRecord>,
}

impl StatisticsSink {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
            log: None,
            echo: true,
            records: Vec::new(),
        }
    }

    /// Also print every line to stdout (on by default).
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    /// Switch to a fresh log file named `<base>_<name>`.
    pub fn start_log(&mut self, name: &str) -> Result<PathBuf> {
        let file_name = format!("{}_{}", crate::defaults::LOG_NAME, name);
        let mut log = LogFile::create_unique(&self.dir, &file_name)?;
        log.write_line(LOG_HEADER)?;
        let path = log.path().to_path_buf();
        info!("Logging statistics to {:?}", path);
        self.log = Some(log);
        Ok(path)
    }

    fn ensure_log(&mut self) -> Result<&mut LogFile> {
        if self.log.is_none() {
            let mut log = LogFile::create_unique(&self.dir, &self.base_name)?;
            log.write_line(LOG_HEADER)?;
            info!("Logging statistics to {:?}", log.path());
            self.log = Some(log);
        }
        self.log
            .as_mut()
            .context("Statistics log unavailable")
    }

    /// Append the log line of a completed run.
    pub fn record(&mut self, record: StatisticsRecord) -> Result<()> {
        let line = record.to_log_line();
        if self.echo {
            println!("{}", line);
        }
        self.ensure_log()?.write_line(&line)?;
        self.records.push(record);
        Ok(())
    }

    /// Insert a free-form entry, e.g. a test label sent by the controller.
    pub fn log_entry(&mut self, entry: &str) -> Result<()> {
        if self.echo {
            println!("{}", entry);
        }
        self.ensure_log()?.write_line(entry)
    }

    pub fn records(&self) -> &[StatisticsRecord] {
        &self.records
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(LogFile::path)
    }
}

/// Session metadata plus every record, as exported to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target: Option<String>,
    pub cpu_cores: usize,
    pub records: Vec<StatisticsRecord>,
}

/// Writes the JSON session report.
pub struct ResultsManager {
    output_file: PathBuf,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
        }
    }

    pub fn write(&self, report: &SessionReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write results to {:?}", self.output_file))?;
        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }
}
