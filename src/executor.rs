//! One request, one outcome.
//!
//! [`RequestExecutor`] wraps the private [`TargetHandle`] of a worker. It times a single exchange
//! with a monotonic clock and classifies the reply. Transport faults never leave the executor:
//! they become failed outcomes carrying the time spent until the fault was detected.
//!
//! Success rules:
//!
//! | operation | success                          |
//! |-----------|----------------------------------|
//! | read      | found (2xx) or not found (404)   |
//! | write     | stored (2xx) or conflict (409)   |
//! | delete    | removed (2xx) or not found (404) |

use crate::workload::Request;
use crate::{Operation, TargetHandle};
use log::trace;
use quanta::Instant;
use std::time::Duration;

/// The result of one request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub latency: Duration,
    pub succeeded: bool,
}

const NOT_FOUND: u16 = 404;
const CONFLICT: u16 = 409;

/// Whether a reply with the given status code counts as a successful `op`.
pub fn is_success(op: Operation, status: u16) -> bool {
    let ok = (200..300).contains(&status);
    match op {
        Operation::Read | Operation::Delete => ok || status == NOT_FOUND,
        Operation::Write => ok || status == CONFLICT,
    }
}

pub struct RequestExecutor {
    handle: Box<dyn TargetHandle>,
}

impl RequestExecutor {
    pub fn new(handle: Box<dyn TargetHandle>) -> Self {
        Self { handle }
    }

    pub fn execute(&mut self, request: &Request) -> RequestOutcome {
        let key = request.key;
        let start = Instant::now();
        let reply = match request.op {
            Operation::Read => self.handle.get(key),
            Operation::Write => self
                .handle
                .set(key, request.value.as_deref().unwrap_or_default()),
            Operation::Delete => self.handle.delete(key),
        };
        let latency = start.elapsed();
        let succeeded = match reply {
            Ok(status) => is_success(request.op, status),
            Err(e) => {
                trace!("{} of key {} failed: {}", request.op, key, e);
                false
            }
        };
        RequestOutcome { latency, succeeded }
    }
}
