//! File outbox notifier.
//!
//! Appends each published message as a JSON line to an outbox file. A relay
//! (mail gateway, chat bot, SNS forwarder) can tail the file and fan the
//! messages out to subscribers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::Notifier;

/// One line of the outbox file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub published_at: DateTime<Utc>,
    pub topic: String,
    pub subject: String,
    pub message: String,
}

/// Notifier writing to a JSONL outbox
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in the outbox
    pub async fn records(&self) -> Result<Vec<OutboxRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read outbox: {}", self.path.display()))?;

        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Failed to parse outbox record"))
            .collect()
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create outbox directory: {}", parent.display()))?;
        }

        let record = OutboxRecord {
            published_at: Utc::now(),
            topic: topic.to_string(),
            subject: subject.to_string(),
            message: message.to_string(),
        };
        let json = serde_json::to_string(&record).context("Failed to serialize outbox record")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open outbox: {}", self.path.display()))?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write outbox record")?;
        file.flush().await.context("Failed to flush outbox")?;

        Ok(())
    }
}
