//! Event Store Integration Tests
//!
//! Tests for event log format, append operations, and replay order.

use batchflow::core::EventStore;
use batchflow::domain::{
    ClassificationResult, ErrorPayload, Event, EventType, JobParameters, RunSpec, TaskFailure,
};
use tempfile::TempDir;
use uuid::Uuid;

#[tokio::test]
async fn test_event_line_format() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    let event = Event::new(run_id, EventType::AttemptFailed, "Attempt 1 failed")
        .with_attempt(1, format!("{}:attempt-1:abc", run_id))
        .with_data(&ErrorPayload::new(
            TaskFailure::new("Essential container in task exited").with_container("App", Some(6)),
        ))
        .unwrap()
        .with_duration(1500)
        .with_error("Essential container in task exited");
    store.append(&event).await.unwrap();

    // One JSON object per line
    let content = std::fs::read_to_string(store.events_path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);

    let raw: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(raw["event_type"], "attempt_failed");
    assert_eq!(raw["attempt"], 1);
    assert_eq!(raw["duration_ms"], 1500);
    assert_eq!(raw["data"]["cause"]["stoppedReason"], "Essential container in task exited");
    assert_eq!(raw["data"]["cause"]["containers"][0]["exitCode"], 6);
    assert!(raw["timestamp"].as_str().unwrap().contains('T'));

    // Unset classification fields are omitted from the first payload
    assert!(raw["data"].get("retryCount").is_none());
}

#[tokio::test]
async fn test_replay_preserves_order_and_data() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    let spec = RunSpec {
        job: JobParameters::new("fileDownloadJob").with_value("FILE_KEY", "test.txt"),
        max_retry_count: 3,
    };
    store
        .append(
            &Event::new(run_id, EventType::RunStarted, "Run started")
                .with_data(&spec)
                .unwrap(),
        )
        .await
        .unwrap();
    store
        .append(
            &Event::new(run_id, EventType::Classified, "Classified")
                .with_data(&ClassificationResult::retryable(0, 1.0))
                .unwrap(),
        )
        .await
        .unwrap();

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].data_as::<RunSpec>().unwrap(), spec);
    assert_eq!(
        events[1].data_as::<ClassificationResult>().unwrap(),
        ClassificationResult::retryable(0, 1.0)
    );
    assert!(events[0].data_as::<ClassificationResult>().is_err());
}

#[tokio::test]
async fn test_event_types_serialization() {
    let event_types = vec![
        (EventType::RunStarted, "run_started"),
        (EventType::AttemptStarted, "attempt_started"),
        (EventType::AttemptSucceeded, "attempt_succeeded"),
        (EventType::AttemptFailed, "attempt_failed"),
        (EventType::AttemptAborted, "attempt_aborted"),
        (EventType::Classified, "classified"),
        (EventType::ClassifierFailed, "classifier_failed"),
        (EventType::RetryScheduled, "retry_scheduled"),
        (EventType::RetryResumed, "retry_resumed"),
        (EventType::RunSucceeded, "run_succeeded"),
        (EventType::RunFailed, "run_failed"),
        (EventType::NotificationSent, "notification_sent"),
    ];

    for (event_type, name) in event_types {
        let json = serde_json::to_string(&event_type).unwrap();
        assert_eq!(json, format!("\"{}\"", name));
        let parsed: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event_type);
    }
}

#[tokio::test]
async fn test_replay_rejects_corrupt_line() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp.path(), run_id).await.unwrap();

    store
        .append(&Event::new(run_id, EventType::RunStarted, "Run started"))
        .await
        .unwrap();
    std::fs::write(
        store.events_path(),
        std::fs::read_to_string(store.events_path()).unwrap() + "{not json\n",
    )
    .unwrap();

    assert!(store.replay().await.is_err());
}

#[tokio::test]
async fn test_empty_store_replays_nothing() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::open(temp.path(), Uuid::new_v4()).await.unwrap();

    assert!(store.replay().await.unwrap().is_empty());
    assert!(store.run_dir().is_dir());
}
