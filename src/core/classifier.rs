//! Error classification.
//!
//! The orchestrator never decides on its own whether a failure is worth
//! retrying. It hands the failure payload to an [`ErrorClassifier`] and only
//! enforces the retry bound on whatever comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ClassificationResult, ErrorPayload};

/// Errors a classifier may report instead of a verdict
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("malformed error payload: {0}")]
    MalformedPayload(String),

    #[error("classifier invocation failed: {0}")]
    Invocation(String),

    #[error("classifier returned an invalid result: {0}")]
    InvalidResponse(String),
}

/// Maps a failure payload to a retry decision.
///
/// Implementations must be free of side effects: classifying the same payload
/// twice yields the same result.
#[async_trait]
pub trait ErrorClassifier: Send + Sync {
    /// Human-readable classifier name
    fn name(&self) -> &str;

    async fn classify(&self, payload: &ErrorPayload) -> Result<ClassificationResult, ClassifierError>;
}

/// Rule set used by [`RuleClassifier`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRules {
    /// Stop-reason prefixes that indicate a transient substrate problem
    #[serde(default = "default_retryable_stop_reasons")]
    pub retryable_stop_reasons: Vec<String>,

    /// Exit codes of the essential container that the job uses to ask for a retry
    #[serde(default = "default_retryable_exit_codes")]
    pub retryable_exit_codes: Vec<i32>,

    /// Upper bound on the computed backoff
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: f64,
}

fn default_retryable_stop_reasons() -> Vec<String> {
    vec![
        "CannotPullContainerError".to_string(),
        "ResourceInitializationError".to_string(),
    ]
}
fn default_retryable_exit_codes() -> Vec<i32> {
    vec![6]
}
fn default_max_wait_seconds() -> f64 {
    3600.0
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            retryable_stop_reasons: default_retryable_stop_reasons(),
            retryable_exit_codes: default_retryable_exit_codes(),
            max_wait_seconds: default_max_wait_seconds(),
        }
    }
}

/// Rule-based classifier with exponential backoff.
///
/// The retry count is the previous payload's count plus one, or zero for the
/// first failure of a run; the wait is `2^retryCount` seconds.
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier {
    rules: ClassifierRules,
}

impl RuleClassifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Synchronous core of the classification
    pub fn evaluate(&self, payload: &ErrorPayload) -> Result<ClassificationResult, ClassifierError> {
        let retry_count = payload.retry_count.map(|c| c.saturating_add(1)).unwrap_or(0);
        let wait_time_seconds = self.wait_for(retry_count);

        if self.is_retryable(payload)? {
            Ok(ClassificationResult::retryable(retry_count, wait_time_seconds))
        } else {
            Ok(ClassificationResult {
                wait_time_seconds,
                ..ClassificationResult::fatal(retry_count)
            })
        }
    }

    fn is_retryable(&self, payload: &ErrorPayload) -> Result<bool, ClassifierError> {
        let cause = &payload.cause;

        if self
            .rules
            .retryable_stop_reasons
            .iter()
            .any(|prefix| cause.stopped_reason.starts_with(prefix.as_str()))
        {
            return Ok(true);
        }

        let container = cause.containers.first().ok_or_else(|| {
            ClassifierError::MalformedPayload(format!(
                "no container report for stop reason '{}'",
                cause.stopped_reason
            ))
        })?;

        Ok(self
            .rules
            .retryable_exit_codes
            .contains(&container.exit_code.unwrap_or(0)))
    }

    fn wait_for(&self, retry_count: u32) -> f64 {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        2f64.powi(exponent).min(self.rules.max_wait_seconds)
    }
}

#[async_trait]
impl ErrorClassifier for RuleClassifier {
    fn name(&self) -> &str {
        "rules"
    }

    async fn classify(&self, payload: &ErrorPayload) -> Result<ClassificationResult, ClassifierError> {
        self.evaluate(payload)
    }
}
