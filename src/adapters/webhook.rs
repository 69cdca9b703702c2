//! Webhook notifier.
//!
//! POSTs each outcome message as JSON to an HTTP endpoint (a chat
//! integration, an SNS-compatible gateway, an alerting relay).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::Notifier;

/// Notifier publishing over HTTP
pub struct WebhookNotifier {
    /// Endpoint receiving the POST
    url: String,

    /// HTTP client
    client: reqwest::Client,
}

/// Request body sent to the webhook
#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    topic: &'a str,
    subject: &'a str,
    message: &'a str,
}

impl WebhookNotifier {
    /// `timeout` bounds each request, connect to response body
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&PublishRequest {
                topic,
                subject,
                message,
            })
            .send()
            .await
            .with_context(|| format!("Failed to reach webhook {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Webhook {} rejected notification ({}): {}", self.url, status, body.trim());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(PublishRequest {
            topic: "jobs",
            subject: "Task failed",
            message: "{}",
        })
        .unwrap();

        assert_eq!(body["topic"], "jobs");
        assert_eq!(body["subject"], "Task failed");
        assert_eq!(body["message"], "{}");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_errors() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_secs(2)).unwrap();
        assert_eq!(notifier.name(), "webhook");
        assert!(notifier.publish("jobs", "Task failed", "{}").await.is_err());
    }
}
