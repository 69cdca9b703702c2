//! Adapter interfaces for external systems.
//!
//! The orchestrator only talks to the outside world through these traits:
//! a [`JobExecutor`] runs the batch job, a [`Notifier`] publishes the
//! terminal outcome. Error classification has its own trait in
//! [`crate::core::classifier`]; [`CommandClassifier`] adapts an external
//! classifier program to it.

pub mod command_classifier;
pub mod container;
pub mod outbox;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{JobFailure, JobParameters};

pub use command_classifier::CommandClassifier;
pub use container::ContainerExecutor;
pub use outbox::OutboxNotifier;
pub use webhook::WebhookNotifier;

/// Identity of one executor invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub run_id: Uuid,

    /// 1-indexed attempt number
    pub attempt: u32,

    /// Stable key a job can use to deduplicate side effects
    pub idempotency_key: String,
}

/// Runs the batch job
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run the job once, returning its output or a structured failure.
    ///
    /// The orchestrator never retries inside a single call.
    async fn run(
        &self,
        params: &JobParameters,
        attempt: &AttemptContext,
    ) -> std::result::Result<serde_json::Value, JobFailure>;
}

/// Publishes outcome messages to subscribers
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Human-readable notifier name
    fn name(&self) -> &str;

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()>;
}
