//! The persisted results table.
//!
//! Each completed run appends one row to a CSV file:
//!
//! ```txt
//! timestamp,workload,concurrency,throughput_req_per_s,avg_latency_ms,p50_ms,p90_ms,p95_ms,p99_ms,success_count,failure_count
//! 2026-10-17 14:03:11,mixed,10,4210.55,2.371,2.104,3.870,4.551,7.012,84211,0
//! ```
//!
//! The header is written once, when the file is created (or found empty). Rows are appended,
//! flushed and synced one by one, so results of finished runs survive a crash or an interruption
//! later in the sweep. An existing table is never truncated: new sweeps keep appending to it.

use crate::error::{Error, Result};
use crate::stats::RunResult;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

const HEADER: [&str; 11] = [
    "timestamp",
    "workload",
    "concurrency",
    "throughput_req_per_s",
    "avg_latency_ms",
    "p50_ms",
    "p90_ms",
    "p95_ms",
    "p99_ms",
    "success_count",
    "failure_count",
];

/// One row of the results table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResultRow {
    pub timestamp: String,
    pub workload: String,
    pub concurrency: usize,
    pub throughput_req_per_s: f64,
    pub avg_latency_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub success_count: u64,
    pub failure_count: u64,
}

fn ms(d: Duration) -> f64 {
    // three decimals is microsecond resolution
    (d.as_secs_f64() * 1_000_000.0).round() / 1000.0
}

impl ResultRow {
    pub fn new(workload: &str, result: &RunResult) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            workload: workload.to_string(),
            concurrency: result.concurrency,
            throughput_req_per_s: (result.throughput * 100.0).round() / 100.0,
            avg_latency_ms: ms(result.mean_latency),
            p50_ms: ms(result.p50),
            p90_ms: ms(result.p90),
            p95_ms: ms(result.p95),
            p99_ms: ms(result.p99),
            success_count: result.success_count,
            failure_count: result.failure_count,
        }
    }
}

/// An append-only CSV table of run results.
#[derive(Debug)]
pub struct ResultsTable {
    path: PathBuf,
    workload: String,
}

impl ResultsTable {
    /// Open (or create) the table. Failing here means the sweep would not be able to persist
    /// anything, so it is reported before the first run.
    pub fn open(path: impl Into<PathBuf>, workload: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let file = Self::open_file(&path)?;
        let empty = file
            .metadata()
            .map_err(|e| Self::persist_error(&path, e.into()))?
            .len()
            == 0;
        if empty {
            let mut writer = csv::Writer::from_writer(&file);
            writer
                .write_record(HEADER)
                .and_then(|_| writer.flush().map_err(csv::Error::from))
                .map_err(|e| Self::persist_error(&path, e))?;
        }
        Ok(Self {
            path,
            workload: workload.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a row and make it durable before returning.
    pub fn append(&mut self, result: &RunResult) -> Result<()> {
        let row = ResultRow::new(&self.workload, result);
        let file = Self::open_file(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&file);
        writer
            .serialize(&row)
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .map_err(|e| Self::persist_error(&self.path, e))?;
        drop(writer);
        file.sync_data()
            .map_err(|e| Self::persist_error(&self.path, e.into()))
    }

    fn open_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Self::persist_error(path, e.into()))
    }

    fn persist_error(path: &Path, source: csv::Error) -> Error {
        Error::Persist {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Read a results table back, e.g. for analysis or plotting.
pub fn load(path: impl AsRef<Path>) -> std::result::Result<Vec<ResultRow>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    reader.deserialize().collect()
}
