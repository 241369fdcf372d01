#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A load-generation harness for remote key-value services with stepped concurrency levels.
//!
//! With `kvsweep`, you describe a **sweep** in a TOML file: the target service, the shape of the
//! traffic (a [`workload`]), and a list of **runs**, each with its own concurrency level. The
//! runs are executed one after another. In every run, a fixed number of worker threads issue
//! requests against the target as fast as it answers until the run's duration elapses. The
//! throughput and the latency distribution of each run are printed as soon as the run finishes and
//! appended to a CSV results table, so a partial sweep is never lost.
//!
//! A few key design choices include:
//!
//! - Keys are integers in a bounded key space. How they are picked depends on the workload: uniform,
//! hot/cold skewed, or sequential per worker to avoid cross-worker collisions.
//! - The service under test is a black box behind the [`Target`] trait. Only status codes and
//! latency are observed. The built-in target speaks HTTP, see [`mod@targets`].
//! - Statistics of a run live in a run-scoped [`stats::StatsAggregator`]; workers can only record
//! into it, and the summary is taken once all workers have stopped.
//!
//! More detailed usage could be found in the module-level rustdocs:
//!
//! - [`mod@bench`] for the config format of a sweep and the run lifecycle.
//! - [`mod@workload`] for the traffic shapes.
//! - [`mod@results`] for the results table.
//! - [`cmdline()`] for the usage of the default command line interface.

use crate::error::BoxError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A remote key-value service that can be put under load.
///
/// The target itself is shared by all workers of a sweep. Each worker creates its own
/// [`TargetHandle`] so that connections are never shared between workers.
pub trait Target: Send + Sync + 'static {
    /// Create a private handle for one worker. Every request made through the handle must give up
    /// after `request_timeout`.
    fn handle(
        &self,
        worker_id: usize,
        request_timeout: Duration,
    ) -> Result<Box<dyn TargetHandle>, BoxError>;

    /// Check that the target can be reached at all. Called once before a sweep starts.
    fn probe(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Human readable address of the target, used in logs and errors.
    fn addr(&self) -> String;
}

/// A per-worker handle to a [`Target`].
///
/// Each method performs exactly one exchange with the service and returns the status code of the
/// reply. Transport faults (timeouts, refused connections, malformed replies) are returned as
/// errors; classifying them is left to [`executor::RequestExecutor`].
pub trait TargetHandle: Send {
    /// Retrieve the value of a key.
    fn get(&mut self, key: u64) -> Result<u16, BoxError>;

    /// Store a value under a key.
    fn set(&mut self, key: u64, value: &str) -> Result<u16, BoxError>;

    /// Remove a key.
    fn delete(&mut self, key: u64) -> Result<u16, BoxError>;
}

/// A single operation that is applied to the key-value service.
#[derive(Serialize, Deserialize, Eq, PartialEq, Hash, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Retrieving the value of a key. A missing key is a valid answer.
    Read,

    /// Storing a generated value under a key.
    Write,

    /// Removing a key. A missing key is a valid answer.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

pub mod bench;
mod cmdline;
pub mod error;
pub mod executor;
pub mod results;
pub mod stats;
pub mod targets;
pub mod thread;
pub mod workload;

pub use cmdline::cmdline;
pub use error::{Error, Result};
