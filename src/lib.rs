//! batchflow - Event-sourced batch job orchestrator
//!
//! Runs a batch job on a cadence, retries failures that an error classifier
//! deems transient with the backoff it prescribes, and publishes exactly one
//! outcome notification per run.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every decision of a run is recorded as an immutable event
//! - Current state is derived by replaying events through the retry machine
//! - Interrupted runs (including ones sleeping out a backoff) can be resumed
//!
//! # Modules
//!
//! - `adapters`: External systems (job executor, notifiers, external classifier)
//! - `core`: Retry machine, classifier policy, event store, orchestrator, trigger
//! - `domain`: Data structures (Event, Run, payloads, notifications)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the configured job once
//! batchflow run -p FILE_KEY=test.txt
//!
//! # Check run status
//! batchflow status <run-id>
//!
//! # Resume an interrupted run
//! batchflow resume <run-id>
//!
//! # Trigger runs daily
//! batchflow schedule --expression "rate(1 day)"
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{ErrorClassifier, Orchestrator, Schedule, Trigger};
pub use domain::{
    ClassificationResult, ErrorPayload, Event, EventType, JobParameters, Outcome, Run, RunStatus,
};
