//! Periodic trigger.
//!
//! Fires a new run on a fixed cadence. Each run is spawned as its own task
//! and nothing is shared between runs, so a slow or failing run never delays
//! the next tick.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::domain::{JobParameters, Outcome};

use super::orchestrator::Orchestrator;

/// Errors parsing a cadence expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("cron expressions are not supported by the local trigger: '{0}' (use rate(<n> <unit>))")]
    CronUnsupported(String),

    #[error("invalid schedule expression '{0}': expected rate(<n> <unit>)")]
    Malformed(String),

    #[error("invalid rate value '{0}': must be a positive integer")]
    InvalidValue(String),

    #[error("unknown rate unit '{0}': expected second(s), minute(s), hour(s) or day(s)")]
    UnknownUnit(String),
}

/// Fixed-rate cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    period: Duration,
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Self { period }
    }

    /// Parse `rate(<n> <unit>)`
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let expression = expression.trim();

        if expression.starts_with("cron(") {
            return Err(ScheduleError::CronUnsupported(expression.to_string()));
        }

        let body = expression
            .strip_prefix("rate(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| ScheduleError::Malformed(expression.to_string()))?;

        let mut parts = body.split_whitespace();
        let (value, unit) = match (parts.next(), parts.next(), parts.next()) {
            (Some(value), Some(unit), None) => (value, unit),
            _ => return Err(ScheduleError::Malformed(expression.to_string())),
        };

        let value: u64 = value
            .parse()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| ScheduleError::InvalidValue(value.to_string()))?;

        let unit_seconds = match unit {
            "second" | "seconds" => 1,
            "minute" | "minutes" => 60,
            "hour" | "hours" => 3_600,
            "day" | "days" => 86_400,
            other => return Err(ScheduleError::UnknownUnit(other.to_string())),
        };

        let seconds = value
            .checked_mul(unit_seconds)
            .ok_or_else(|| ScheduleError::InvalidValue(value.to_string()))?;

        Ok(Self::every(Duration::from_secs(seconds)))
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.period.as_secs();
        let (value, unit) = if secs % 86_400 == 0 {
            (secs / 86_400, "day")
        } else if secs % 3_600 == 0 {
            (secs / 3_600, "hour")
        } else if secs % 60 == 0 {
            (secs / 60, "minute")
        } else {
            (secs, "second")
        };
        let plural = if value == 1 { "" } else { "s" };
        write!(f, "rate({} {}{})", value, unit, plural)
    }
}

/// Starts a run per tick
pub struct Trigger {
    orchestrator: Arc<Orchestrator>,
    schedule: Schedule,
    params: JobParameters,
    max_retry_count: u32,
}

impl Trigger {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        schedule: Schedule,
        params: JobParameters,
        max_retry_count: u32,
    ) -> Self {
        Self {
            orchestrator,
            schedule,
            params,
            max_retry_count,
        }
    }

    /// Tick until `max_runs` runs have been started (forever when `None`),
    /// then wait for the started runs to finish.
    ///
    /// The first run starts immediately. Returns the number of runs started.
    pub async fn run(&self, max_runs: Option<usize>) -> usize {
        // tokio rejects a zero period
        let period = self.schedule.period().max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut runs = JoinSet::new();
        let mut started = 0usize;

        info!(schedule = %self.schedule, job = %self.params.job_name, "Trigger armed");

        while max_runs.map_or(true, |max| started < max) {
            interval.tick().await;
            started += 1;

            let orchestrator = Arc::clone(&self.orchestrator);
            let params = self.params.clone();
            let max_retry_count = self.max_retry_count;
            runs.spawn(async move { orchestrator.execute(params, max_retry_count).await });

            // Reap whatever already finished so the set stays small
            while let Some(joined) = runs.try_join_next() {
                log_run(joined);
            }
        }

        while let Some(joined) = runs.join_next().await {
            log_run(joined);
        }

        started
    }
}

fn log_run(joined: Result<anyhow::Result<Outcome>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(outcome)) => info!(
            run_id = %outcome.run_id,
            status = %outcome.status,
            attempts = outcome.attempts,
            "Triggered run finished"
        ),
        Ok(Err(e)) => error!(error = %format!("{:#}", e), "Triggered run errored"),
        Err(e) => warn!(error = %e, "Triggered run task panicked"),
    }
}
