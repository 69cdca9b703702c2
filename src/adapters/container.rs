//! Container job executor.
//!
//! Runs the job as a child process (typically a container runtime
//! invocation such as `docker run --rm <image>`), exporting the job
//! parameters as environment variables. Process outcomes are translated into
//! the stop reports the classifier understands.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{AttemptContext, JobExecutor};
use crate::domain::{JobFailure, JobParameters, TaskFailure};

/// Stop reason reported when the job process exits non-zero
pub const STOP_REASON_EXITED: &str = "Essential container in task exited";

/// Stop reason reported when the job process is killed by a signal
pub const STOP_REASON_SIGNALED: &str = "Essential container in task was stopped by a signal";

/// Largest stdout/stderr tail kept in payloads
const OUTPUT_TAIL_BYTES: usize = 4096;

/// Executor that runs a command per attempt
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    /// Name reported in container exit reports
    container_name: String,

    command: String,

    args: Vec<String>,

    /// Hard limit for one attempt
    timeout: Duration,
}

impl ContainerExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            container_name: "App".to_string(),
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn with_container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = name.into();
        self
    }

    fn spawn_failure(&self, error: &std::io::Error) -> JobFailure {
        let reason = if error.kind() == std::io::ErrorKind::NotFound {
            format!("CannotPullContainerError: '{}' not found", self.command)
        } else {
            format!("ResourceInitializationError: failed to start '{}': {}", self.command, error)
        };
        JobFailure::Task(TaskFailure::new(reason))
    }
}

#[async_trait]
impl JobExecutor for ContainerExecutor {
    fn name(&self) -> &str {
        "container"
    }

    async fn run(
        &self,
        params: &JobParameters,
        attempt: &AttemptContext,
    ) -> Result<serde_json::Value, JobFailure> {
        let started = Instant::now();

        let child = Command::new(&self.command)
            .args(&self.args)
            .envs(&params.values)
            .env("BATCHFLOW_JOB_NAME", &params.job_name)
            .env("BATCHFLOW_RUN_ID", attempt.run_id.to_string())
            .env("BATCHFLOW_ATTEMPT", attempt.attempt.to_string())
            .env("BATCHFLOW_ATTEMPT_KEY", &attempt.idempotency_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_failure(&e))?;

        // Dropping the child on timeout kills it
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(JobFailure::Aborted {
                    reason: format!("failed to wait for '{}': {}", self.command, e),
                })
            }
            Err(_) => {
                return Err(JobFailure::Aborted {
                    reason: format!("'{}' timed out after {:?}", self.command, self.timeout),
                })
            }
        };

        let stdout = tail(&String::from_utf8_lossy(&output.stdout));
        let stderr = tail(&String::from_utf8_lossy(&output.stderr));
        debug!(
            command = %self.command,
            status = %output.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job process finished"
        );

        if output.status.success() {
            return Ok(json!({
                "exitCode": 0,
                "stdout": stdout,
            }));
        }

        warn!(command = %self.command, status = %output.status, stderr = %stderr, "Job process failed");

        let failure = match output.status.code() {
            Some(code) => {
                TaskFailure::new(STOP_REASON_EXITED).with_container(&self.container_name, Some(code))
            }
            None => TaskFailure::new(STOP_REASON_SIGNALED).with_container(&self.container_name, None),
        };
        Err(JobFailure::Task(failure))
    }
}

/// Keep the last `OUTPUT_TAIL_BYTES` of `text`, on a char boundary
fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= OUTPUT_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - OUTPUT_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
