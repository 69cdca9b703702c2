//! Job parameters, failure payloads and classification results.
//!
//! The JSON shapes here are shared with external classifiers, so field
//! names follow the classifier contract (`type`, `retryCount`,
//! `waitTimeSeconds`) rather than Rust naming.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Parameters handed unchanged to the job executor on every attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Logical job name (e.g. "fileDownloadJob")
    pub job_name: String,

    /// Key/value pairs exported to the job
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl JobParameters {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            values: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Stable hash of the parameters (first 16 hex chars of SHA256)
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.job_name.as_bytes());
        for (key, value) in &self.values {
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

/// Exit report of a single container in a stopped task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerExit {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Why a job task stopped without succeeding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    /// Stop reason reported by the execution substrate
    pub stopped_reason: String,

    /// Per-container exit reports (first entry is the essential container)
    #[serde(default)]
    pub containers: Vec<ContainerExit>,
}

impl TaskFailure {
    pub fn new(stopped_reason: impl Into<String>) -> Self {
        Self {
            stopped_reason: stopped_reason.into(),
            containers: Vec::new(),
        }
    }

    pub fn with_container(mut self, name: impl Into<String>, exit_code: Option<i32>) -> Self {
        self.containers.push(ContainerExit {
            name: name.into(),
            exit_code,
        });
        self
    }
}

/// Failure returned by a job executor invocation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobFailure {
    /// The task ran and stopped with a failure report
    #[error("task failed: {}", .0.stopped_reason)]
    Task(TaskFailure),

    /// The execution substrate itself gave up (timeout, kill)
    #[error("job execution aborted: {reason}")]
    Aborted { reason: String },
}

/// Classification tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Retryable,
    Fatal,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Structured failure handed to the classifier.
///
/// Classification fields are unset for the first failure of a run; later
/// payloads carry the previous classification's `retryCount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub cause: TaskFailure,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_seconds: Option<f64>,
}

impl ErrorPayload {
    /// Payload for a failure with no prior classification
    pub fn new(cause: TaskFailure) -> Self {
        Self {
            cause,
            classification: None,
            retry_count: None,
            wait_time_seconds: None,
        }
    }

    /// Carry the previous classification forward under the run's own retry count
    pub fn following(
        cause: TaskFailure,
        previous: Option<&ClassificationResult>,
        retry_count: u32,
    ) -> Self {
        match previous {
            Some(prev) => Self {
                cause,
                classification: Some(prev.kind),
                retry_count: Some(retry_count),
                wait_time_seconds: Some(prev.wait_time_seconds),
            },
            None => Self::new(cause),
        }
    }
}

/// Classifier verdict for one failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    #[serde(rename = "type")]
    pub kind: Classification,

    pub retry_count: u32,

    pub wait_time_seconds: f64,
}

impl ClassificationResult {
    pub fn retryable(retry_count: u32, wait_time_seconds: f64) -> Self {
        Self {
            kind: Classification::Retryable,
            retry_count,
            wait_time_seconds,
        }
    }

    pub fn fatal(retry_count: u32) -> Self {
        Self {
            kind: Classification::Fatal,
            retry_count,
            wait_time_seconds: 0.0,
        }
    }
}
