//! Operator CLI for the flakeguard engine
//!
//! Loads run batches (and retry policies) from JSON files into an
//! in-memory engine, then prints the requested result as JSON on stdout.
//! Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Classify everything in a results dump
//! flakeguard-cli analyze --runs runs.json
//!
//! # Should attempt 2 of `checkout_flow` be retried?
//! flakeguard-cli evaluate-retry --runs runs.json --policies retry.json \
//!     --project web --test checkout_flow --attempt 2 --error "connection reset"
//!
//! # Suggested quarantine policy for a project
//! flakeguard-cli recommend --runs runs.json --project web
//!
//! # Periodic sweeps until Ctrl-C
//! RUST_LOG=flakeguard=debug flakeguard-cli sweep --runs runs.json --project web --project api
//! ```

mod inputs;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use flakeguard::{
    spawn_periodic_sweeps, Backends, FlakeGuard, FlakeguardConfig, IngestionReport, ManualClock,
    RetryRequest, RunBatch, SharedClock, SystemClock,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration (TOML); FLAKEGUARD_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Evaluate as of this instant (RFC 3339) instead of the wall clock
    #[arg(long, global = true)]
    now: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest run batches and print the resulting flaky patterns
    Analyze {
        /// JSON array of run batches
        #[arg(long)]
        runs: PathBuf,
    },

    /// Decide whether a failed test should be retried
    EvaluateRetry {
        /// JSON array of run batches, used for the flaky status
        #[arg(long)]
        runs: Option<PathBuf>,

        /// JSON array of retry policies
        #[arg(long)]
        policies: PathBuf,

        #[arg(long)]
        project: String,

        #[arg(long)]
        test: String,

        #[arg(long)]
        suite: Option<String>,

        /// Retries already performed for this failure
        #[arg(long, default_value_t = 0)]
        attempt: u32,

        /// Error text of the failure
        #[arg(long)]
        error: Option<String>,
    },

    /// Print the recommended quarantine policy for a project
    Recommend {
        #[arg(long)]
        runs: PathBuf,

        #[arg(long)]
        project: String,
    },

    /// Run classification and unquarantine sweeps until Ctrl-C
    Sweep {
        #[arg(long)]
        runs: PathBuf,

        /// Projects to sweep (repeatable)
        #[arg(long = "project", required = true)]
        projects: Vec<String>,
    },
}

#[derive(Serialize)]
struct AnalyzeOutput {
    reports: Vec<IngestionReport>,
    patterns: Vec<flakeguard::state::FlakyTestPattern>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = FlakeguardConfig::load(args.config.as_deref()).context("loading configuration")?;
    let clock: SharedClock = match args.now {
        Some(now) => Arc::new(ManualClock::new(now)),
        None => Arc::new(SystemClock),
    };
    let guard = FlakeGuard::new(config.clone(), Backends::in_memory(), clock);

    match args.command {
        Command::Analyze { runs } => {
            let batches = inputs::load_batches(&runs)?;
            let projects = project_ids(&batches);
            let reports = ingest(&guard, batches);
            let mut patterns = Vec::new();
            for project in &projects {
                patterns.extend(
                    guard
                        .patterns(project)
                        .with_context(|| format!("listing patterns for {}", project))?,
                );
            }
            print_json(&AnalyzeOutput { reports, patterns })?;
        }

        Command::EvaluateRetry {
            runs,
            policies,
            project,
            test,
            suite,
            attempt,
            error,
        } => {
            if let Some(runs) = runs {
                ingest(&guard, inputs::load_batches(&runs)?);
            }
            for policy in inputs::load_policies(&policies)? {
                let name = policy.name.clone();
                guard
                    .create_retry_policy(policy)
                    .with_context(|| format!("retry policy '{}' rejected", name))?;
            }

            let mut request = RetryRequest::new(project, test, attempt);
            if let Some(suite) = suite {
                request = request.with_suite(suite);
            }
            if let Some(error) = error {
                request = request.with_error(error);
            }
            print_json(&guard.evaluate_retry(request))?;
        }

        Command::Recommend { runs, project } => {
            ingest(&guard, inputs::load_batches(&runs)?);
            let policy = guard
                .recommended_policy(&project)
                .with_context(|| format!("recommending a policy for {}", project))?;
            print_json(&policy)?;
        }

        Command::Sweep { runs, projects } => {
            ingest(&guard, inputs::load_batches(&runs)?);
            let guard = Arc::new(guard);
            let cancel = CancellationToken::new();
            let handle = spawn_periodic_sweeps(
                guard.clone(),
                projects,
                config.sweep.clone(),
                cancel.clone(),
            );

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("Shutdown requested");
            cancel.cancel();
            handle.await.context("sweep task panicked")?;
        }
    }

    Ok(())
}

fn project_ids(batches: &[RunBatch]) -> BTreeSet<String> {
    batches.iter().map(|b| b.project_id.clone()).collect()
}

fn ingest(guard: &FlakeGuard, batches: Vec<RunBatch>) -> Vec<IngestionReport> {
    batches
        .into_iter()
        .map(|batch| {
            let project = batch.project_id.clone();
            let report = guard.submit_run_outcomes(batch);
            for warning in &report.warnings {
                warn!(project = %project, warning = %warning, "Ingestion degraded");
            }
            report
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{}", json);
    Ok(())
}
