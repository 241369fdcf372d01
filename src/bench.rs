//! The core sweep functionality.
//!
//! A sweep in this crate refers to a group of load runs against the same target with the same
//! workload, each run at its own **concurrency** level. Runs are executed strictly one after
//! another, with a cooldown in between so the target can settle.
//!
//! ## Configuration Format
//!
//! A sweep configuration file is formatted in TOML. Besides the `[target]` section (see
//! [`crate::targets::http`]) and the `[workload]` section (see [`crate::workload`]), it consists of
//! the definition of multiple runs, each defined in a dictionary named `run`. Runs are organized in
//! an array, so the configuration of each run starts with `[[run]]`. It also supports a `[global]`
//! section that fills the missing fields in each run, plus the options of the sweep itself.
//!
//! ```toml
//! [target]
//! host = "localhost"
//! port = 1234
//!
//! [workload]
//! kind = "mixed"
//! key_space = 10000
//!
//! [global]
//! duration = 20.0         # seconds of load per run, default 20
//! request_timeout = 5.0   # seconds, default 5
//! grace_period = 2.0      # seconds to wait for workers after a run, default 2
//! cooldown = 5.0          # seconds between two runs, default 5
//! cdf = false             # print the latency CDF after each run, default false
//! results = "benchmark.csv"
//!
//! [[run]]
//! concurrency = 10
//!
//! [[run]]
//! concurrency = 50
//! duration = 30.0
//! ```
//!
//! Available options can be found in [`RunOpt`] and [`GlobalOpt`]. Options can be overwritten via
//! environment variables without changing the TOML file: the variable `KVSWEEP_GLOBAL__DURATION`
//! overrides `duration` in `[global]`, for example.
//!
//! ## Output Format
//!
//! Every finished run is appended to the results table right away (see [`crate::results`]) and
//! reported on stdout as a single plain text line:
//!
//! ```txt
//! run 0 concurrency 10 duration 20.00 elapsed 20.03 total 84211 success 84211 failure 0 rps 4210.55 avg_ms 2.371 p50_ms 2.104 p90_ms 3.870 p95_ms 4.551 p99_ms 7.012 max_ms 31.507
//! ```
//!
//! Where `duration` is the length of the load period of the run and `elapsed` is the time since
//! the sweep started, both in seconds. `rps` counts successful requests only.
//!
//! When `cdf` is `true`, the latency CDF of successful requests is appended to the same line as
//! `cdf_us percentile` followed by `<us> <percentile>` tuples, one per microsecond, up to the
//! maximum recorded latency:
//!
//! ```txt
//! ... max_ms 31.507 cdf_us percentile 1 0.00 2 0.00 3 12.50 4 40.00 ...
//! ```
//!
//! ## Run Lifecycle
//!
//! A run moves through [`RunState`]: workers are spawned while held at a start gate (`Idle`), the
//! gate opens and the clock starts (`Running`), the cancellation flag is raised once the duration
//! has elapsed (`Draining`), and workers get at most the grace period to finish their in-flight
//! request (`Completed`). Workers that overrun the grace period are **abandoned**: they are
//! detached and whatever they record afterwards is discarded.

use crate::error::{ensure_config, Error, Result};
use crate::executor::RequestExecutor;
use crate::results::ResultsTable;
use crate::stats::{RunResult, StatsAggregator};
use crate::targets::http::HttpTargetOpt;
use crate::thread::{DefaultThread, JoinHandle, Thread};
use crate::workload::{Workload, WorkloadOpt, WorkloadSpec};
use crate::Target;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use log::{debug, info, warn};
use parking_lot::RwLock;
use quanta::Instant;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DURATION: f64 = 20.0;
const DEFAULT_REQUEST_TIMEOUT: f64 = 5.0;
const DEFAULT_GRACE_PERIOD: f64 = 2.0;
const DEFAULT_COOLDOWN: f64 = 5.0;
const DEFAULT_RESULTS: &str = "benchmark.csv";

/// Upper bound of workers in a single run.
pub const MAX_CONCURRENCY: usize = 100_000;

// {{{ run

/// The configuration of a single run deserialized from a TOML string.
///
/// The fields are optional to ease parsing from TOML, as there can be global parameters that are
/// set for them.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RunOpt {
    /// Number of workers, each issuing one request at a time. Must be given, either here or via
    /// the `--steps` option of the command line.
    pub concurrency: Option<usize>,

    /// How long the load is applied, in seconds.
    ///
    /// Default: 20.
    pub duration: Option<f64>,

    /// Per-request timeout, in seconds. A request that times out counts as a failure.
    ///
    /// Default: 5.
    pub request_timeout: Option<f64>,

    /// How long to wait for workers to finish after the duration elapsed, in seconds.
    ///
    /// Default: 2.
    pub grace_period: Option<f64>,
}

/// The validated configuration of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub concurrency: usize,
    pub duration: Duration,
    pub request_timeout: Duration,
    pub grace_period: Duration,
}

fn seconds(name: &str, value: f64, allow_zero: bool) -> Result<Duration> {
    ensure_config!(
        value.is_finite() && (value > 0.0 || (allow_zero && value == 0.0)),
        "{} should be a {} number of seconds, got {}",
        name,
        if allow_zero { "non-negative" } else { "positive" },
        value
    );
    Duration::try_from_secs_f64(value).map_err(|e| Error::Config(format!("{}: {}", name, e)))
}

impl RunConfig {
    /// Internal function called after all global options are applied.
    fn new(opt: &RunOpt) -> Result<Self> {
        let Some(concurrency) = opt.concurrency else {
            return Err(Error::Config("concurrency should be given".to_string()));
        };
        ensure_config!(concurrency > 0, "concurrency should be positive");
        ensure_config!(
            concurrency <= MAX_CONCURRENCY,
            "concurrency should be at most {}, got {}",
            MAX_CONCURRENCY,
            concurrency
        );
        Ok(Self {
            concurrency,
            duration: seconds("duration", opt.duration.unwrap_or(DEFAULT_DURATION), false)?,
            request_timeout: seconds(
                "request_timeout",
                opt.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                false,
            )?,
            grace_period: seconds(
                "grace_period",
                opt.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD),
                true,
            )?,
        })
    }
}

// }}} run

// {{{ sweep

/// The global options that go to the `[global]` section.
///
/// The run options override missing fields in each `[[run]]` section. For their usage, please
/// refer to [`RunOpt`]. The rest are options of the sweep itself.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct GlobalOpt {
    // run
    pub duration: Option<f64>,
    pub request_timeout: Option<f64>,
    pub grace_period: Option<f64>,
    // sweep
    /// Pause between two runs, in seconds. Default: 5.
    pub cooldown: Option<f64>,
    /// Print the latency CDF after each run. Default: false.
    pub cdf: Option<bool>,
    /// Path of the results table. Default: `benchmark.csv`.
    pub results: Option<PathBuf>,
}

impl GlobalOpt {
    fn apply(&self, opt: &mut RunOpt) {
        opt.duration = opt.duration.or(self.duration);
        opt.request_timeout = opt.request_timeout.or(self.request_timeout);
        opt.grace_period = opt.grace_period.or(self.grace_period);
    }
}

#[derive(Deserialize, Clone, Debug)]
struct SweepOpt {
    global: Option<GlobalOpt>,
    target: HttpTargetOpt,
    workload: WorkloadOpt,
    #[serde(default)]
    run: Vec<RunOpt>,
}

/// A fully validated sweep.
#[derive(Debug)]
pub struct SweepConfig {
    pub target: HttpTargetOpt,
    pub workload: WorkloadSpec,
    pub runs: Vec<RunConfig>,
    pub results: PathBuf,
    pub cooldown: Duration,
    pub cdf: bool,
}

/// Parse and validate a sweep configuration. If `steps` is given, the `[[run]]` sections are
/// replaced by one run per step, using the global options.
///
/// Every problem is reported as [`Error::Config`] here, before anything runs.
pub fn init(text: &str, steps: Option<&[usize]>) -> Result<SweepConfig> {
    let opt: SweepOpt = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::prefixed("KVSWEEP_").split("__"))
        .extract()
        .map_err(|e| Error::Config(e.to_string()))?;
    debug!("Creating sweep with the following configurations: {:?}", opt);

    let global = opt.global.clone().unwrap_or_default();
    let mut ropts = match steps {
        Some(steps) => steps
            .iter()
            .map(|c| RunOpt {
                concurrency: Some(*c),
                ..Default::default()
            })
            .collect(),
        None => opt.run.clone(),
    };
    ensure_config!(!ropts.is_empty(), "at least one run should be given");
    for ropt in ropts.iter_mut() {
        global.apply(ropt);
    }
    debug!("Global options applied to runs: {:?}", ropts);

    let runs = ropts
        .iter()
        .map(RunConfig::new)
        .collect::<Result<Vec<_>>>()?;
    let workload = WorkloadSpec::new(&opt.workload)?;
    let cooldown = seconds(
        "cooldown",
        global.cooldown.unwrap_or(DEFAULT_COOLDOWN),
        true,
    )?;
    let results = global
        .results
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS));
    ensure_config!(
        !results.as_os_str().is_empty(),
        "results should be a non-empty path"
    );

    Ok(SweepConfig {
        target: opt.target,
        workload,
        runs,
        results,
        cooldown,
        cdf: global.cdf.unwrap_or(false),
    })
}

// }}} sweep

// {{{ orchestrator

/// Lifecycle of a single run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Completed,
}

/// Sends the id of a worker to the orchestrator when the worker exits, panics included.
struct Done {
    id: usize,
    tx: Sender<usize>,
}

impl Drop for Done {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id);
    }
}

struct Worker {
    id: usize,
    executor: RequestExecutor,
    workload: Workload,
    stats: Arc<StatsAggregator>,
    cancel: Arc<AtomicBool>,
    gate: Arc<RwLock<()>>,
}

impl Worker {
    fn run(mut self) {
        // blocks until the orchestrator opens the gate
        drop(self.gate.read());
        while !self.cancel.load(Ordering::Acquire) {
            let request = self.workload.next();
            let outcome = self.executor.execute(&request);
            self.stats.record(outcome);
        }
        debug!(
            "worker {} stopped after {} requests",
            self.id,
            self.workload.count()
        );
    }
}

/// Wait for `timeout`, or until a stop signal arrives. Returns `true` if stopped.
fn wait_or_stop(stop: &Receiver<()>, timeout: Duration) -> bool {
    let start = Instant::now();
    match stop.recv_timeout(timeout) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout) => false,
        Err(RecvTimeoutError::Disconnected) => {
            // nobody can stop us anymore, just wait
            std::thread::sleep(timeout.saturating_sub(start.elapsed()));
            false
        }
    }
}

/// Drives a single run from `Idle` to `Completed`.
///
/// One orchestrator can execute many runs one after another; every run gets a fresh
/// [`StatsAggregator`].
pub struct RunOrchestrator<'a> {
    target: &'a dyn Target,
    workload: &'a WorkloadSpec,
    thread: &'a dyn Thread,
    state: RunState,
    stats: Arc<StatsAggregator>,
    abandoned: usize,
    /// Runs started so far
    runs: u64,
}

impl<'a> RunOrchestrator<'a> {
    pub fn new(target: &'a dyn Target, workload: &'a WorkloadSpec, thread: &'a dyn Thread) -> Self {
        Self {
            target,
            workload,
            thread,
            state: RunState::Idle,
            stats: Arc::new(StatsAggregator::new()),
            abandoned: 0,
            runs: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Number of workers abandoned by the last run.
    pub fn abandoned(&self) -> usize {
        self.abandoned
    }

    /// The aggregator of the last (or current) run.
    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Execute one run. A stop signal received on `stop` while the load is applied cancels the
    /// run; it is still drained, but [`Error::Interrupted`] is returned instead of a result.
    pub fn run(&mut self, config: &RunConfig, stop: &Receiver<()>) -> Result<RunResult> {
        self.state = RunState::Idle;
        self.stats = Arc::new(StatsAggregator::new());
        self.abandoned = 0;
        let run = self.runs;
        self.runs += 1;

        let cancel = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(RwLock::new(()));
        let (done_tx, done_rx) = mpsc::channel();

        let closed = gate.write();
        let mut handles = Vec::new();
        let mut fault = None;
        for id in 1..=config.concurrency {
            match self.spawn_worker(run, id, config, &cancel, &gate, &done_tx) {
                Ok(handle) => handles.push((id, handle)),
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }
        }
        drop(done_tx);

        let start = Instant::now();
        self.state = RunState::Running;
        drop(closed);

        let interrupted = match fault {
            Some(ref e) => {
                warn!("aborting run with {} workers: {}", config.concurrency, e);
                false
            }
            None => wait_or_stop(stop, config.duration),
        };
        cancel.store(true, Ordering::Release);
        let elapsed = start.elapsed();

        self.state = RunState::Draining;
        let panicked = self.drain(handles, done_rx, config.grace_period);
        self.stats.seal();
        self.state = RunState::Completed;

        if let Some(e) = fault {
            return Err(e);
        }
        if let Some(id) = panicked {
            return Err(Error::WorkerPanic(id));
        }
        if interrupted {
            return Err(Error::Interrupted);
        }
        Ok(self.stats.snapshot(config.concurrency, elapsed))
    }

    fn spawn_worker(
        &self,
        run: u64,
        id: usize,
        config: &RunConfig,
        cancel: &Arc<AtomicBool>,
        gate: &Arc<RwLock<()>>,
        done: &Sender<usize>,
    ) -> Result<Box<dyn JoinHandle>> {
        let handle = self
            .target
            .handle(id, config.request_timeout)
            .map_err(|source| Error::Connect { worker: id, source })?;
        let worker = Worker {
            id,
            executor: RequestExecutor::new(handle),
            workload: self.workload.worker(run, id),
            stats: self.stats.clone(),
            cancel: cancel.clone(),
            gate: gate.clone(),
        };
        let tx = done.clone();
        self.thread
            .spawn(
                format!("worker-{}", id),
                Box::new(move || {
                    let _done = Done { id, tx };
                    worker.run();
                }),
            )
            .map_err(|source| Error::Spawn { worker: id, source })
    }

    /// Join workers as they report back, until all did or the grace period is over. Returns the
    /// first worker found to have panicked.
    fn drain(
        &mut self,
        mut handles: Vec<(usize, Box<dyn JoinHandle>)>,
        done: Receiver<usize>,
        grace_period: Duration,
    ) -> Option<usize> {
        let deadline = Instant::now() + grace_period;
        let mut panicked = None;
        let mut join = |handle: Box<dyn JoinHandle>, id: usize| {
            if !handle.join() {
                panicked.get_or_insert(id);
            }
        };

        while !handles.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match done.recv_timeout(deadline - now) {
                Ok(id) => {
                    if let Some(pos) = handles.iter().position(|(i, _)| *i == id) {
                        let (id, handle) = handles.swap_remove(pos);
                        join(handle, id);
                    }
                }
                Err(_) => break,
            }
        }

        // workers that reported back right at the deadline are about to exit
        while let Ok(id) = done.try_recv() {
            if let Some(pos) = handles.iter().position(|(i, _)| *i == id) {
                let (id, handle) = handles.swap_remove(pos);
                join(handle, id);
            }
        }

        let (finished, stuck): (Vec<_>, Vec<_>) =
            handles.into_iter().partition(|(_, h)| h.is_finished());
        for (id, handle) in finished {
            join(handle, id);
        }

        self.abandoned = stuck.len();
        if !stuck.is_empty() {
            let ids: Vec<usize> = stuck.iter().map(|(id, _)| *id).collect();
            warn!(
                "{} worker(s) did not stop within {:.2}s and are abandoned: {:?}",
                ids.len(),
                grace_period.as_secs_f64(),
                ids
            );
        }
        // dropping the handles detaches the threads
        drop(stuck);
        panicked
    }
}

// }}} orchestrator

// {{{ controller

/// Executes the runs of a sweep in order and persists each result as soon as it exists.
pub struct SweepController<'a> {
    config: &'a SweepConfig,
    target: &'a dyn Target,
    thread: &'a dyn Thread,
}

impl<'a> SweepController<'a> {
    pub fn new(config: &'a SweepConfig, target: &'a dyn Target, thread: &'a dyn Thread) -> Self {
        Self {
            config,
            target,
            thread,
        }
    }

    /// Run the whole sweep. Results of completed runs are on disk even if this returns an error.
    pub fn run(&self, stop: &Receiver<()>) -> Result<Vec<RunResult>> {
        let config = self.config;
        let mut table = ResultsTable::open(&config.results, config.workload.kind().to_string())?;
        let mut orchestrator = RunOrchestrator::new(self.target, &config.workload, self.thread);
        let since = Instant::now();
        let mut results = Vec::with_capacity(config.runs.len());

        for (i, run) in config.runs.iter().enumerate() {
            if stop.try_recv().is_ok() {
                return Err(Error::Interrupted);
            }
            info!(
                "run {} starting: {} workers for {:.2}s against {}",
                i,
                run.concurrency,
                run.duration.as_secs_f64(),
                self.target.addr()
            );
            let result = orchestrator.run(run, stop)?;
            table.append(&result)?;
            report(i, &result, since, config.cdf.then(|| orchestrator.stats()));
            info!(
                "run {} finished: {:.2} req/s, {} failures, {} abandoned worker(s), row appended to {}",
                i,
                result.throughput,
                result.failure_count,
                orchestrator.abandoned(),
                table.path().display()
            );
            results.push(result);

            if i + 1 < config.runs.len() && wait_or_stop(stop, config.cooldown) {
                return Err(Error::Interrupted);
            }
        }
        // a stop that arrived while the last run was draining
        if stop.try_recv().is_ok() {
            return Err(Error::Interrupted);
        }
        Ok(results)
    }
}

fn report(run: usize, result: &RunResult, since: Instant, cdf: Option<&StatsAggregator>) {
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    print!(
        "run {} concurrency {} duration {:.2} elapsed {:.2} total {} success {} failure {} \
         rps {:.2} avg_ms {:.3} p50_ms {:.3} p90_ms {:.3} p95_ms {:.3} p99_ms {:.3} max_ms {:.3}",
        run,
        result.concurrency,
        result.elapsed_time.as_secs_f64(),
        since.elapsed().as_secs_f64(),
        result.total_attempts,
        result.success_count,
        result.failure_count,
        result.throughput,
        ms(result.mean_latency),
        ms(result.p50),
        ms(result.p90),
        ms(result.p95),
        ms(result.p99),
        ms(result.max_latency),
    );
    if let Some(stats) = cdf {
        print!(" cdf_us percentile");
        for (us, percentile) in stats.latency_cdf() {
            print!(" {} {:.2}", us, percentile);
        }
    }
    println!();
}

/// Probe the target, then run the sweep with [`std::thread`] workers.
pub fn sweep(
    config: &SweepConfig,
    target: &dyn Target,
    stop: &Receiver<()>,
) -> Result<Vec<RunResult>> {
    target.probe().map_err(|source| Error::Unreachable {
        addr: target.addr(),
        source,
    })?;
    debug!("target {} is reachable", target.addr());
    SweepController::new(config, target, &DefaultThread).run(stop)
}

// }}} controller

// {{{ tests


// }}} tests
