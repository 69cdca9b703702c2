//! Run state and reconstruction from events.
//!
//! A Run is one end-to-end execution of the batch job, from trigger to its
//! single terminal notification.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};
use super::payload::{ClassificationResult, ErrorPayload, JobParameters, TaskFailure};
use crate::core::machine::{FailureReason, MachineState, Phase, Signal};

/// Body of the `run_started` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub job: JobParameters,
    pub max_retry_count: u32,
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Last thing the job executor produced
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum RunPayload {
    #[default]
    None,
    Output(serde_json::Value),
    Error(ErrorPayload),
    Aborted(String),
}

/// A batch job run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Parameters passed to every attempt
    pub job: JobParameters,

    /// State machine position, retry count and retry bound
    pub machine: MachineState,

    /// Number of executor invocations so far
    pub attempts: u32,

    /// Last executor output or error
    pub payload: RunPayload,

    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal phase
    pub completed_at: Option<DateTime<Utc>>,

    /// Whether the pending wait has its `retry_scheduled` record
    #[serde(default)]
    pub wait_scheduled: bool,

    /// Whether `run_succeeded`/`run_failed` was recorded
    pub closed: bool,

    /// Whether the terminal notification was published
    pub notified: bool,
}

impl Run {
    /// Create a new run in the initial `Running` phase
    pub fn new(id: Uuid, job: JobParameters, max_retry_count: u32) -> Self {
        Self {
            id,
            job,
            machine: MachineState::new(max_retry_count),
            attempts: 0,
            payload: RunPayload::None,
            started_at: Utc::now(),
            completed_at: None,
            wait_scheduled: false,
            closed: false,
            notified: false,
        }
    }

    /// Reconstruct run state from its event log
    pub fn from_events(events: &[Event]) -> Result<Self> {
        let first = events.first().context("Event log is empty")?;
        if first.event_type != EventType::RunStarted {
            bail!(
                "Event log for run {} does not start with run_started (found {:?})",
                first.run_id,
                first.event_type
            );
        }

        let spec: RunSpec = first.data_as()?;
        let mut run = Self::new(first.run_id, spec.job, spec.max_retry_count);
        run.started_at = first.timestamp;

        for event in &events[1..] {
            run.apply_event(event)
                .with_context(|| format!("Failed to replay event {} of run {}", event.id, run.id))?;
        }

        Ok(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) -> Result<()> {
        if event.run_id != self.id {
            bail!("Event belongs to run {}, not {}", event.run_id, self.id);
        }

        match event.event_type {
            EventType::RunStarted => bail!("Duplicate run_started event"),
            EventType::AttemptStarted => {
                self.attempts = self.attempts.max(event.attempt.unwrap_or(self.attempts + 1));
            }
            EventType::AttemptSucceeded => {
                let output = event.data.clone().unwrap_or(serde_json::Value::Null);
                self.signal(&Signal::JobSucceeded, event.timestamp)?;
                self.payload = RunPayload::Output(output);
            }
            EventType::AttemptFailed => {
                let payload: ErrorPayload = event.data_as()?;
                self.signal(&Signal::JobFailed(payload.clone()), event.timestamp)?;
                self.payload = RunPayload::Error(payload);
            }
            EventType::AttemptAborted => {
                let reason = event.error.clone().unwrap_or_default();
                self.signal(
                    &Signal::JobAborted {
                        reason: reason.clone(),
                    },
                    event.timestamp,
                )?;
                self.payload = RunPayload::Aborted(reason);
            }
            EventType::Classified => {
                let result: ClassificationResult = event.data_as()?;
                self.signal(&Signal::Classified(result.clone()), event.timestamp)?;
                if let RunPayload::Error(ref mut payload) = self.payload {
                    payload.classification = Some(result.kind);
                    payload.retry_count = Some(self.machine.retry_count);
                    payload.wait_time_seconds = Some(result.wait_time_seconds);
                }
            }
            EventType::ClassifierFailed => {
                let reason = event.error.clone().unwrap_or_default();
                self.signal(&Signal::ClassifierFailed { reason }, event.timestamp)?;
            }
            EventType::RetryScheduled => {
                if !matches!(self.machine.phase, Phase::Waiting { .. }) {
                    bail!("retry_scheduled recorded while {}", self.machine.phase.name());
                }
                self.wait_scheduled = true;
            }
            EventType::RetryResumed => {
                self.signal(&Signal::TimerElapsed, event.timestamp)?;
                self.wait_scheduled = false;
            }
            EventType::RunSucceeded | EventType::RunFailed => {
                let expected = match event.event_type {
                    EventType::RunSucceeded => RunStatus::Succeeded,
                    _ => RunStatus::Failed,
                };
                if self.status() != expected {
                    bail!(
                        "{:?} recorded while run is {}",
                        event.event_type,
                        self.machine.phase.name()
                    );
                }
                if self.closed {
                    bail!("Run {} was already closed", self.id);
                }
                self.closed = true;
            }
            EventType::NotificationSent => {
                if !self.is_finished() {
                    bail!("notification_sent recorded before the run finished");
                }
                self.notified = true;
            }
        }

        Ok(())
    }

    /// Feed a signal through the state machine
    pub fn signal(&mut self, signal: &Signal, now: DateTime<Utc>) -> Result<()> {
        self.machine = self.machine.next(signal, now)?;
        if self.machine.phase.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn status(&self) -> RunStatus {
        match self.machine.phase {
            Phase::Succeeded => RunStatus::Succeeded,
            Phase::Failed { .. } => RunStatus::Failed,
            _ => RunStatus::Pending,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.machine.phase
    }

    pub fn retry_count(&self) -> u32 {
        self.machine.retry_count
    }

    pub fn max_retry_count(&self) -> u32 {
        self.machine.max_retry_count
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.machine.phase {
            Phase::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        !self.machine.phase.is_terminal()
    }

    /// Check if the run has reached a terminal phase
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Error payload to hand the classifier for a fresh failure
    pub fn next_error_payload(&self, cause: TaskFailure) -> ErrorPayload {
        ErrorPayload::following(
            cause,
            self.machine.last_classification.as_ref(),
            self.machine.retry_count,
        )
    }

    /// Terminal summary of the run
    pub fn outcome(&self) -> Outcome {
        Outcome {
            run_id: self.id,
            job_name: self.job.job_name.clone(),
            status: self.status(),
            attempts: self.attempts,
            retry_count: self.retry_count(),
            failure: self.failure_reason().cloned(),
            payload: self.payload.clone(),
        }
    }
}

/// Result of driving a run to its end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub run_id: Uuid,
    pub job_name: String,
    pub status: RunStatus,
    pub attempts: u32,
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    pub payload: RunPayload,
}
