use crate::bench::{self, SweepConfig};
use crate::targets::http::HttpTarget;
use crate::Error;
use anyhow::Context;
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::{debug, error};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::channel;

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(short = 'c')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the sweep's TOML config file")]
    config: PathBuf,

    #[arg(short = 'o')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the results table, overrides `results` in the config file")]
    results: Option<PathBuf>,

    #[arg(long, value_delimiter = ',')]
    #[arg(help = "Concurrency levels, one run each, replacing the runs in the config file")]
    steps: Option<Vec<usize>>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(short = 'c')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the sweep's TOML config file")]
    config: PathBuf,

    #[arg(long, value_delimiter = ',')]
    #[arg(help = "Concurrency levels, one run each, replacing the runs in the config file")]
    steps: Option<Vec<usize>>,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a sweep against a key-value service")]
    Bench(BenchArgs),
    #[command(about = "Validate a sweep config file and print its runs")]
    Check(CheckArgs),
}

fn load(path: &Path, steps: Option<&[usize]>) -> anyhow::Result<SweepConfig> {
    let text = read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = bench::init(&text, steps)
        .with_context(|| format!("failed to load config file {}", path.display()))?;
    Ok(config)
}

fn bench_cli(args: &BenchArgs) -> anyhow::Result<()> {
    let mut config = load(&args.config, args.steps.as_deref())?;
    if let Some(results) = &args.results {
        config.results = results.clone();
    }
    let target = HttpTarget::new(&config.target);

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        // the sweep may already be gone
        let _ = stop_tx.send(());
        debug!("SIGINT received and stop message sent to sweep");
    })
    .context("failed to set Ctrl-C handler")?;

    let results = bench::sweep(&config, &target, &stop_rx)?;
    debug!(
        "sweep finished, {} result(s) in {}",
        results.len(),
        config.results.display()
    );
    Ok(())
}

fn check_cli(args: &CheckArgs) -> anyhow::Result<()> {
    let config = load(&args.config, args.steps.as_deref())?;
    println!(
        "target {}:{} workload {} key_space {} results {} cooldown {:.2}",
        config.target.host,
        config.target.port,
        config.workload.kind(),
        config.workload.key_space(),
        config.results.display(),
        config.cooldown.as_secs_f64(),
    );
    for (i, run) in config.runs.iter().enumerate() {
        println!(
            "run {} concurrency {} duration {:.2} request_timeout {:.2} grace_period {:.2}",
            i,
            run.concurrency,
            run.duration.as_secs_f64(),
            run.request_timeout.as_secs_f64(),
            run.grace_period.as_secs_f64(),
        );
    }
    Ok(())
}

/// `0` on success, `130` if interrupted, `1` for everything else.
fn exit_code(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<Error>() {
                Some(Error::Interrupted) => ExitCode::from(130),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

/// The default command line interface.
///
/// This function is public and can be called in a different crate, e.g., to wrap it in a binary
/// with a different name.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// kvsweep -h
/// ```
///
/// The interface supports two modes, `bench` and `check`.
///
/// ### Bench Mode
///
/// Usage:
///
/// ```bash
/// kvsweep bench -c <CONFIG> [-o <RESULTS>] [--steps 10,50,100]
/// ```
///
/// Where `CONFIG` is the path to the sweep configuration file, whose format is documented in
/// [`crate::bench`]. `-o` overrides the path of the results table and `--steps` replaces the runs
/// of the file with one run per concurrency level.
///
/// The target is probed once, then the runs are executed one by one. Ctrl-C stops the sweep; the
/// runs that completed before stay in the results table.
///
/// ### Check Mode
///
/// Usage:
///
/// ```bash
/// kvsweep check -c <CONFIG> [--steps 10,50,100]
/// ```
///
/// Validate the configuration file and print the runs it describes, without contacting the
/// target.
///
/// ### Exit Status
///
/// - `0`: all runs completed, regardless of how many requests failed.
/// - `1`: a fatal error, e.g., an invalid configuration or an unreachable target.
/// - `130`: the sweep was interrupted.
///
/// Log verbosity is controlled with `RUST_LOG`, e.g., `RUST_LOG=debug`.
pub fn cmdline() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting kvsweep with args: {:?}", cli);
    let result = match cli.command {
        Commands::Bench(args) => bench_cli(&args),
        Commands::Check(args) => check_cli(&args),
    };
    exit_code(result)
}
