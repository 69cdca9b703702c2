//! Core orchestration logic.
//!
//! This module contains:
//! - Machine: Pure retry state machine
//! - Classifier: Error classification trait and rule-based policy
//! - EventStore: Append-only event logging and run locks
//! - Orchestrator: Drives runs through the machine
//! - Trigger: Periodic run scheduling

pub mod classifier;
pub mod event_store;
pub mod machine;
pub mod orchestrator;
pub mod timer;
pub mod trigger;

// Re-export commonly used types
pub use classifier::{ClassifierError, ClassifierRules, ErrorClassifier, RuleClassifier};
pub use event_store::{generate_idempotency_key, EventStore, RunLock};
pub use machine::{
    FailureReason, MachineState, Phase, Signal, TransitionError, DEFAULT_MAX_RETRY_COUNT,
};
pub use orchestrator::{
    classifier_from_config, list_runs, load_run, Orchestrator, DEFAULT_CLASSIFIER_TIMEOUT,
    DEFAULT_PUBLISH_TIMEOUT,
};
pub use timer::{Sleeper, TokioSleeper};
pub use trigger::{Schedule, ScheduleError, Trigger};
