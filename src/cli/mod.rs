//! Command-line interface for batchflow.
//!
//! Provides commands for triggering runs, resuming interrupted runs,
//! inspecting run state, running the periodic trigger and trying out the
//! configured classifier.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config;
use crate::core::{
    classifier_from_config, list_runs, load_run, ErrorClassifier, Orchestrator, Phase, Schedule,
    Trigger,
};
use crate::domain::{ErrorPayload, Outcome, Run, RunStatus};

/// batchflow - Event-sourced batch job orchestrator
#[derive(Parser, Debug)]
#[command(name = "batchflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the configured job once, retrying classified failures
    Run {
        /// Job parameter (repeatable), overrides job.parameters
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Override job.name
        #[arg(long)]
        job_name: Option<String>,

        /// Override retry.max_retry_count
        #[arg(short, long)]
        max_retry_count: Option<u32>,
    },

    /// Resume an interrupted run from its event log
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Trigger runs periodically
    Schedule {
        /// Cadence, e.g. "rate(1 day)" (defaults to schedule.expression)
        #[arg(short, long)]
        expression: Option<String>,

        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<usize>,
    },

    /// Classify an error payload with the configured classifier
    Classify {
        /// Payload JSON file (reads from stdin if not provided)
        #[arg(short, long)]
        payload: Option<PathBuf>,
    },

    /// Show resolved configuration
    Config,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                params,
                job_name,
                max_retry_count,
            } => run_job(params, job_name, max_retry_count).await,
            Commands::Resume { run_id } => resume_run(&run_id).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => show_runs(limit).await,
            Commands::Schedule {
                expression,
                max_runs,
            } => run_schedule(expression, max_runs).await,
            Commands::Classify { payload } => classify_payload(payload).await,
            Commands::Config => show_config(),
        }
    }
}

/// Run the configured job once
async fn run_job(
    params: Vec<(String, String)>,
    job_name: Option<String>,
    max_retry_count: Option<u32>,
) -> Result<()> {
    let cfg = config::config()?;

    let mut job = cfg.job_parameters();
    if let Some(name) = job_name {
        job.job_name = name;
    }
    for (key, value) in params {
        job = job.with_value(key, value);
    }

    let orchestrator = Orchestrator::from_config(cfg)?;
    let outcome = orchestrator
        .execute(job, max_retry_count.unwrap_or(cfg.retry.max_retry_count))
        .await?;

    report(&outcome, "completed")
}

/// Resume an interrupted run
async fn resume_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let cfg = config::config()?;

    let orchestrator = Orchestrator::from_config(cfg)?;
    let outcome = orchestrator.resume(run_id).await?;

    report(&outcome, "resumed and completed")
}

fn report(outcome: &Outcome, verb: &str) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(outcome).context("Failed to serialize outcome")?
    );

    match (&outcome.status, &outcome.failure) {
        (RunStatus::Succeeded, _) => {
            eprintln!(
                "\n[Run {} {} successfully after {} attempt(s)]",
                outcome.run_id, verb, outcome.attempts
            );
            Ok(())
        }
        (_, Some(reason)) => {
            eprintln!("\n[Run {} failed: {}]", outcome.run_id, reason);
            std::process::exit(1);
        }
        (status, None) => {
            eprintln!("\n[Run {} in state: {}]", outcome.run_id, status);
            Ok(())
        }
    }
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let run = load_run(&config::runs_dir()?, run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Job: {}", run.job.job_name);
    println!("Phase: {}", run.phase().name());
    println!("Status: {}", run.status());
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("Attempts: {}", run.attempts);
    println!("Retries: {}/{}", run.retry_count(), run.max_retry_count());
    if let Some(reason) = run.failure_reason() {
        println!("Failure: {}", reason);
    }
    if let Phase::Waiting { resume_at } = run.phase() {
        println!("Next attempt at: {}", resume_at);
    }
    println!("Notified: {}", if run.notified { "yes" } else { "no" });

    if !run.job.values.is_empty() {
        println!("\nParameters:");
        for (key, value) in &run.job.values {
            println!("  {}={}", key, value);
        }
    }

    Ok(())
}

/// List recent runs
async fn show_runs(limit: usize) -> Result<()> {
    let runs = list_runs(&config::runs_dir()?, limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:<9} {:<8}",
        "RUN ID", "JOB", "PHASE", "ATTEMPTS", "RETRIES"
    );
    println!("{}", "-".repeat(90));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<12} {:<9} {:<8}",
            run.id,
            run.job.job_name,
            run.phase().name(),
            run.attempts,
            retries(&run)
        );
    }

    Ok(())
}

fn retries(run: &Run) -> String {
    format!("{}/{}", run.retry_count(), run.max_retry_count())
}

/// Run the periodic trigger
async fn run_schedule(expression: Option<String>, max_runs: Option<usize>) -> Result<()> {
    let cfg = config::config()?;
    let expression = expression.unwrap_or_else(|| cfg.schedule.expression.clone());
    let schedule = Schedule::parse(&expression)?;

    let orchestrator = Arc::new(Orchestrator::from_config(cfg)?);
    let trigger = Trigger::new(
        orchestrator,
        schedule,
        cfg.job_parameters(),
        cfg.retry.max_retry_count,
    );

    let started = trigger.run(max_runs).await;
    eprintln!("[Trigger stopped after {} run(s)]", started);
    Ok(())
}

/// Classify a payload read from a file or stdin
async fn classify_payload(path: Option<PathBuf>) -> Result<()> {
    let raw = if let Some(path) = path {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No payload provided. Use --payload <file> or pipe JSON to stdin");
    };

    let payload: ErrorPayload =
        serde_json::from_str(&raw).context("Failed to parse error payload")?;

    let cfg = config::config()?;
    let classifier = classifier_from_config(&cfg.classifier);
    let result = classifier.classify(&payload).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize classification")?
    );
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Runs:        {}", cfg.runs_dir().display());
    println!("Outbox:      {}", cfg.outbox_path().display());
    println!();
    print!(
        "{}",
        serde_yaml::to_string(cfg).context("Failed to render configuration")?
    );

    Ok(())
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid run ID: {}", raw))
}
