//! Retry state machine.
//!
//! The machine is a pure transition table: it never performs I/O. The
//! orchestrator performs the effect implied by the current phase (invoke the
//! job, classify, wait, notify) and feeds the resulting [`Signal`] back in.
//! Replaying a run's event log goes through the same table, so a rehydrated
//! run lands in exactly the phase it was persisted in.
//!
//! ```text
//! Running ──success──────────────────────────────▶ Succeeded
//!    │ failure                                     ▲
//!    ▼                                             │
//! Evaluating ──retryable && retries < max───────▶ Waiting ──timer──▶ Running
//!    │ fatal / exhausted / classifier malfunction
//!    ▼
//! Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Classification, ClassificationResult, ErrorPayload};

/// Default retry bound when none is configured
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 5;

/// Errors raised by an illegal transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("run already reached terminal phase '{phase}', cannot apply '{signal}'")]
    Terminal {
        phase: &'static str,
        signal: &'static str,
    },

    #[error("signal '{signal}' is not valid in phase '{phase}'")]
    Invalid {
        phase: &'static str,
        signal: &'static str,
    },
}

/// Why a run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum FailureReason {
    /// Classifier said the failure is not worth retrying
    Fatal,

    /// Retryable, but the retry bound was reached
    RetriesExhausted { retry_count: u32 },

    /// The execution substrate aborted the job
    Aborted { detail: String },

    /// The classifier errored, panicked, timed out or returned garbage
    ClassifierMalfunction { detail: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal error"),
            Self::RetriesExhausted { retry_count } => {
                write!(f, "retries exhausted after {} retries", retry_count)
            }
            Self::Aborted { detail } => write!(f, "job aborted: {}", detail),
            Self::ClassifierMalfunction { detail } => {
                write!(f, "classifier malfunction: {}", detail)
            }
        }
    }
}

/// Phase of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum Phase {
    /// Job executor is (about to be) invoked
    Running,

    /// A failure is waiting for classification
    Evaluating { payload: ErrorPayload },

    /// Backing off until `resume_at`
    Waiting { resume_at: DateTime<Utc> },

    Succeeded,

    Failed { reason: FailureReason },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Evaluating { .. } => "evaluating",
            Self::Waiting { .. } => "waiting",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// Input to the transition table
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    JobSucceeded,
    JobFailed(ErrorPayload),
    JobAborted { reason: String },
    Classified(ClassificationResult),
    ClassifierFailed { reason: String },
    TimerElapsed,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobSucceeded => "job_succeeded",
            Self::JobFailed(_) => "job_failed",
            Self::JobAborted { .. } => "job_aborted",
            Self::Classified(_) => "classified",
            Self::ClassifierFailed { .. } => "classifier_failed",
            Self::TimerElapsed => "timer_elapsed",
        }
    }
}

/// Everything the transition table needs to decide the next phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub phase: Phase,

    /// Retries recorded so far; never decreases, never exceeds `max_retry_count`
    pub retry_count: u32,

    pub max_retry_count: u32,

    /// Waits entered so far, independent of what the classifier reports
    #[serde(default)]
    pub retries_scheduled: u32,

    /// Most recent classifier verdict, carried into the next error payload
    pub last_classification: Option<ClassificationResult>,
}

impl MachineState {
    /// Initial state of a freshly triggered run
    pub fn new(max_retry_count: u32) -> Self {
        Self {
            phase: Phase::Running,
            retry_count: 0,
            max_retry_count,
            retries_scheduled: 0,
            last_classification: None,
        }
    }

    /// Apply a signal, returning the successor state
    pub fn next(&self, signal: &Signal, now: DateTime<Utc>) -> Result<Self, TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::Terminal {
                phase: self.phase.name(),
                signal: signal.name(),
            });
        }

        let mut next = self.clone();

        match (&self.phase, signal) {
            (Phase::Running, Signal::JobSucceeded) => {
                next.phase = Phase::Succeeded;
            }
            (Phase::Running, Signal::JobFailed(payload)) => {
                next.phase = Phase::Evaluating {
                    payload: payload.clone(),
                };
            }
            (Phase::Running, Signal::JobAborted { reason }) => {
                next.phase = Phase::Failed {
                    reason: FailureReason::Aborted {
                        detail: reason.clone(),
                    },
                };
            }
            (Phase::Evaluating { .. }, Signal::Classified(result)) => {
                let retries = self.retries_taken(result);
                next.phase = self.decide(result, retries, now);
                if !matches!(
                    next.phase,
                    Phase::Failed {
                        reason: FailureReason::ClassifierMalfunction { .. }
                    }
                ) {
                    next.retry_count = retries.min(self.max_retry_count);
                    next.last_classification = Some(result.clone());
                }
                if matches!(next.phase, Phase::Waiting { .. }) {
                    next.retries_scheduled += 1;
                }
            }
            (Phase::Evaluating { .. }, Signal::ClassifierFailed { reason }) => {
                next.phase = Phase::Failed {
                    reason: FailureReason::ClassifierMalfunction {
                        detail: reason.clone(),
                    },
                };
            }
            (Phase::Waiting { .. }, Signal::TimerElapsed) => {
                next.phase = Phase::Running;
            }
            (phase, signal) => {
                return Err(TransitionError::Invalid {
                    phase: phase.name(),
                    signal: signal.name(),
                });
            }
        }

        Ok(next)
    }

    /// Retry count the bound is checked against. The classifier's report can
    /// raise it but never lower it below the waits already taken.
    fn retries_taken(&self, result: &ClassificationResult) -> u32 {
        self.retry_count
            .max(self.retries_scheduled)
            .max(result.retry_count)
    }

    /// Evaluating → Waiting | Failed
    fn decide(&self, result: &ClassificationResult, retries: u32, now: DateTime<Utc>) -> Phase {
        if !result.wait_time_seconds.is_finite() {
            return Phase::Failed {
                reason: FailureReason::ClassifierMalfunction {
                    detail: format!("waitTimeSeconds is not a number: {}", result.wait_time_seconds),
                },
            };
        }

        match result.kind {
            Classification::Fatal => Phase::Failed {
                reason: FailureReason::Fatal,
            },
            Classification::Retryable if retries < self.max_retry_count => {
                match resume_instant(now, result.wait_time_seconds) {
                    Some(resume_at) => Phase::Waiting { resume_at },
                    None => Phase::Failed {
                        reason: FailureReason::ClassifierMalfunction {
                            detail: format!(
                                "waitTimeSeconds out of range: {}",
                                result.wait_time_seconds
                            ),
                        },
                    },
                }
            }
            Classification::Retryable => Phase::Failed {
                reason: FailureReason::RetriesExhausted {
                    retry_count: retries.min(self.max_retry_count),
                },
            },
        }
    }
}

/// `now + wait`, with zero or negative waits resuming immediately
fn resume_instant(now: DateTime<Utc>, wait_time_seconds: f64) -> Option<DateTime<Utc>> {
    if wait_time_seconds <= 0.0 {
        return Some(now);
    }
    let millis = (wait_time_seconds * 1000.0).round();
    if millis >= i64::MAX as f64 {
        return None;
    }
    let delta = chrono::Duration::try_milliseconds(millis as i64)?;
    now.checked_add_signed(delta)
}
