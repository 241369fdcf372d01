//! Run-scoped statistics.
//!
//! Every run owns a fresh [`StatsAggregator`]. Workers only ever call [`StatsAggregator::record`];
//! the orchestrator seals the aggregator once the drain barrier has passed and then takes a single
//! [`RunResult`] snapshot from it.
//!
//! Percentiles use the nearest-rank method: for `n` sorted latencies, percentile `p` is the value
//! at index `ceil(p / 100 * n) - 1`, clamped to `[0, n - 1]`. Only successful requests contribute
//! latencies. If there are none, every latency-derived metric is zero.

use crate::executor::RequestOutcome;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::time::Duration;

/// The raw counters and latencies of one run.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Latencies of successful requests only, in no particular order.
    pub latencies: Vec<Duration>,
}

impl RunStats {
    fn record(&mut self, outcome: RequestOutcome) {
        self.total_attempts += 1;
        if outcome.succeeded {
            self.success_count += 1;
            self.latencies.push(outcome.latency);
        } else {
            self.failure_count += 1;
        }
    }
}

/// The immutable summary of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub concurrency: usize,
    /// Intended load duration: from the start of the run to the moment cancellation was set.
    pub elapsed_time: Duration,
    /// Successful requests per second.
    pub throughput: f64,
    pub mean_latency: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max_latency: Duration,
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Nearest-rank percentile of an ascending slice. Zero for an empty slice.
pub fn nearest_rank(sorted: &[Duration], percentile: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let n = sorted.len();
    let rank = (percentile / 100.0 * n as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, n as i64 - 1) as usize;
    sorted[index]
}

fn mean(latencies: &[Duration]) -> Duration {
    if latencies.is_empty() {
        return Duration::ZERO;
    }
    let total: u128 = latencies.iter().map(|d| d.as_nanos()).sum();
    Duration::from_nanos((total / latencies.len() as u128) as u64)
}

struct Inner {
    stats: RunStats,
    sealed: bool,
}

/// Thread-safe accumulator of the outcomes of one run.
///
/// The lock only guards the counter increments and the latency append.
pub struct StatsAggregator(Mutex<Inner>);

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self(Mutex::new(Inner {
            stats: RunStats::default(),
            sealed: false,
        }))
    }

    pub fn record(&self, outcome: RequestOutcome) {
        let mut inner = self.0.lock();
        if !inner.sealed {
            inner.stats.record(outcome);
        }
    }

    /// Stop accepting outcomes. Anything recorded afterwards (by abandoned workers) is dropped.
    pub fn seal(&self) {
        self.0.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.0.lock().sealed
    }

    /// A copy of the raw counters.
    pub fn stats(&self) -> RunStats {
        self.0.lock().stats.clone()
    }

    /// Compute the summary of the run. Must only be called once no worker records anymore, which
    /// is the orchestrator's job, not the aggregator's.
    pub fn snapshot(&self, concurrency: usize, elapsed_time: Duration) -> RunResult {
        let RunStats {
            total_attempts,
            success_count,
            failure_count,
            latencies: mut sorted,
        } = self.stats();
        sorted.sort_unstable();

        let throughput = if elapsed_time.is_zero() {
            0.0
        } else {
            success_count as f64 / elapsed_time.as_secs_f64()
        };

        RunResult {
            concurrency,
            elapsed_time,
            throughput,
            mean_latency: mean(&sorted),
            p50: nearest_rank(&sorted, 50.0),
            p90: nearest_rank(&sorted, 90.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
            max_latency: sorted.last().copied().unwrap_or_default(),
            total_attempts,
            success_count,
            failure_count,
        }
    }

    /// The latency CDF as `(us, percentile)` pairs, one per microsecond bucket up to the maximum
    /// recorded latency. Empty if nothing succeeded.
    pub fn latency_cdf(&self) -> Vec<(u64, f64)> {
        let Ok(mut hdr) = Histogram::<u64>::new(3) else {
            return Vec::new();
        };
        for latency in self.0.lock().stats.latencies.iter() {
            hdr.saturating_record(latency.as_nanos() as u64);
        }
        let total = hdr.len();
        let mut cdf = Vec::new();
        if total == 0 {
            return cdf;
        }
        let mut count = 0;
        for v in hdr.iter_linear(1000) {
            let ns = v.value_iterated_to();
            count += v.count_since_last_iteration();
            cdf.push(((ns + 1) / 1000, count as f64 * 100.0 / total as f64));
            if ns >= hdr.max() {
                break;
            }
        }
        cdf
    }
}
