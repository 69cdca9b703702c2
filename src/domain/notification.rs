//! Outcome notifications.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::payload::JobParameters;
use super::run::{Outcome, RunStatus};

/// Where and how outcome messages are published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Topic the notifier publishes to
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_success_subject")]
    pub success_subject: String,

    #[serde(default = "default_failure_subject")]
    pub failure_subject: String,
}

fn default_topic() -> String {
    "batch-job-outcomes".to_string()
}
fn default_success_subject() -> String {
    "Task successfully processed.".to_string()
}
fn default_failure_subject() -> String {
    "Task failed".to_string()
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            success_subject: default_success_subject(),
            failure_subject: default_failure_subject(),
        }
    }
}

/// A single outgoing outcome message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub subject: String,

    /// JSON document describing the outcome
    pub message: String,
}

/// JSON body of an outcome message
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody<'a> {
    #[serde(flatten)]
    outcome: &'a Outcome,
    parameters: &'a JobParameters,
}

impl Notification {
    /// Build the message for a terminal outcome
    pub fn for_outcome(
        settings: &NotificationSettings,
        outcome: &Outcome,
        parameters: &JobParameters,
    ) -> Result<Self> {
        let subject = match outcome.status {
            RunStatus::Succeeded => settings.success_subject.clone(),
            RunStatus::Failed => settings.failure_subject.clone(),
            RunStatus::Pending => anyhow::bail!(
                "Run {} has no terminal outcome to notify",
                outcome.run_id
            ),
        };

        let message = serde_json::to_string_pretty(&MessageBody {
            outcome,
            parameters,
        })
        .context("Failed to serialize notification message")?;

        Ok(Self {
            topic: settings.topic.clone(),
            subject,
            message,
        })
    }
}
