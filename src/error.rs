//! Fatal errors of a sweep.
//!
//! Transport faults of single requests are never represented here: they are turned into failed
//! [`crate::executor::RequestOutcome`]s by the executor. Everything in [`Error`] stops the sweep.

use std::path::PathBuf;

/// A boxed error returned by [`crate::Target`] implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The sweep configuration is invalid. Always raised before the first run starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The target did not answer the reachability probe.
    #[error("target {addr} is unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: BoxError,
    },

    /// The operating system refused to create a worker thread.
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    /// The per-worker connection to the target could not be created.
    #[error("failed to create a target handle for worker {worker}: {source}")]
    Connect {
        worker: usize,
        #[source]
        source: BoxError,
    },

    /// A worker thread panicked inside its request loop.
    #[error("worker {0} panicked")]
    WorkerPanic(usize),

    /// A computed result could not be written to the results table.
    #[error("failed to persist results to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// The sweep was stopped from outside (e.g., Ctrl-C).
    #[error("sweep interrupted")]
    Interrupted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::Config(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;
