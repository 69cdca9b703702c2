//! Event types for the event-sourced orchestrator.
//!
//! Every decision the orchestrator takes is recorded as an immutable event
//! in an append-only log. The log is the run's durable checkpoint.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only event log.
///
/// The current state of any run can be reconstructed by replaying its events
/// in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Type of event
    pub event_type: EventType,

    /// Attempt number (1-indexed) for attempt-scoped events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Idempotency key format: "{run_id}:attempt-{n}:{params_hash}"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Human-readable summary
    pub summary: String,

    /// Structured body (job spec, output, error payload, classification)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Time taken in milliseconds (for finished attempts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if something failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(run_id: Uuid, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            event_type,
            attempt: None,
            idempotency_key: None,
            summary: summary.into(),
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Scope the event to an attempt
    pub fn with_attempt(mut self, attempt: u32, idempotency_key: impl Into<String>) -> Self {
        self.attempt = Some(attempt);
        self.idempotency_key = Some(idempotency_key.into());
        self
    }

    /// Attach a structured body
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self> {
        let value = serde_json::to_value(data).context("Failed to serialize event data")?;
        self.data = Some(value);
        Ok(self)
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Decode the structured body
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .with_context(|| format!("Event {:?} {} has no data", self.event_type, self.id))?;
        serde_json::from_value(data)
            .with_context(|| format!("Event {:?} {} has malformed data", self.event_type, self.id))
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run was triggered (data: job parameters and retry bound)
    RunStarted,

    /// The job executor is being invoked
    AttemptStarted,

    /// The job finished successfully (data: job output)
    AttemptSucceeded,

    /// The job stopped with a failure report (data: error payload)
    AttemptFailed,

    /// The execution substrate gave up on the job
    AttemptAborted,

    /// The classifier returned a verdict (data: classification result)
    Classified,

    /// The classifier could not produce a verdict
    ClassifierFailed,

    /// A retry wait was scheduled
    RetryScheduled,

    /// The retry wait elapsed
    RetryResumed,

    /// The run reached `Succeeded`
    RunSucceeded,

    /// The run reached `Failed`
    RunFailed,

    /// The terminal notification was published
    NotificationSent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ClassificationResult;

    #[test]
    fn test_event_serialization() {
        let run_id = Uuid::new_v4();
        let event = Event::new(run_id, EventType::AttemptStarted, "Attempt 1")
            .with_attempt(1, format!("{}:attempt-1:abc", run_id));

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::AttemptStarted);
        assert_eq!(parsed.attempt, Some(1));
        assert!(json.contains("\"attempt_started\""));
        assert!(!json.contains("duration_ms"));
    }

    #[test]
    fn test_event_data_round_trip() {
        let event = Event::new(Uuid::new_v4(), EventType::Classified, "Classified")
            .with_data(&ClassificationResult::retryable(1, 2.0))
            .unwrap();

        let result: ClassificationResult = event.data_as().unwrap();
        assert_eq!(result.retry_count, 1);
    }

    #[test]
    fn test_missing_data_is_an_error() {
        let event = Event::new(Uuid::new_v4(), EventType::Classified, "Classified");
        assert!(event.data_as::<ClassificationResult>().is_err());
    }
}
