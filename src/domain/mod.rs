//! Domain types for the batchflow orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of run decisions
//! - Run: Run state rebuilt from events
//! - Payload: Job parameters, error payloads, classification results
//! - Notification: Outcome messages

pub mod events;
pub mod notification;
pub mod payload;
pub mod run;

// Re-export commonly used types
pub use events::{Event, EventType};
pub use notification::{Notification, NotificationSettings};
pub use payload::{
    Classification, ClassificationResult, ContainerExit, ErrorPayload, JobFailure, JobParameters,
    TaskFailure,
};
pub use run::{Outcome, Run, RunPayload, RunSpec, RunStatus};
