//! External classifier invoked as a subprocess.
//!
//! The error payload is written to the program's stdin as JSON and a
//! classification result (`{"type", "retryCount", "waitTimeSeconds"}`) is
//! read back from stdout. This lets an existing classifier function be
//! reused unchanged.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::classifier::{ClassifierError, ErrorClassifier};
use crate::domain::{ClassificationResult, ErrorPayload};

/// Classifier delegating to an external program
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    command: String,
    args: Vec<String>,
}

impl CommandClassifier {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl ErrorClassifier for CommandClassifier {
    fn name(&self) -> &str {
        "command"
    }

    async fn classify(&self, payload: &ErrorPayload) -> Result<ClassificationResult, ClassifierError> {
        let input = serde_json::to_vec(payload)
            .map_err(|e| ClassifierError::MalformedPayload(e.to_string()))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClassifierError::Invocation(format!("failed to spawn '{}': {}", self.command, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| ClassifierError::Invocation(format!("failed to write payload: {}", e)))?;
            // Drop stdin to signal EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ClassifierError::Invocation(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClassifierError::Invocation(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            ClassifierError::InvalidResponse(format!(
                "{} (stdout: {})",
                e,
                String::from_utf8_lossy(&output.stdout).trim()
            ))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{Classification, TaskFailure};

    fn shell(script: &str) -> CommandClassifier {
        CommandClassifier::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn payload() -> ErrorPayload {
        ErrorPayload::new(TaskFailure::new("CannotPullContainerError"))
    }

    #[tokio::test]
    async fn test_reads_classification_from_stdout() {
        let classifier = shell(
            r#"cat > /dev/null; echo '{"type":"retryable","retryCount":0,"waitTimeSeconds":1}'"#,
        );

        let result = classifier.classify(&payload()).await.unwrap();
        assert_eq!(result.kind, Classification::Retryable);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test]
    async fn test_payload_reaches_stdin() {
        let classifier = shell(
            r#"payload=$(cat); case "$payload" in *CannotPullContainerError*) echo '{"type":"fatal","retryCount":0,"waitTimeSeconds":0}';; esac"#,
        );

        let result = classifier.classify(&payload()).await.unwrap();
        assert_eq!(result.kind, Classification::Fatal);
    }

    #[tokio::test]
    async fn test_garbage_output_is_invalid() {
        let classifier = shell("cat > /dev/null; echo not-json");
        assert!(matches!(
            classifier.classify(&payload()).await,
            Err(ClassifierError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_invocation_error() {
        let classifier = shell("cat > /dev/null; exit 3");
        assert!(matches!(
            classifier.classify(&payload()).await,
            Err(ClassifierError::Invocation(_))
        ));
    }
}
