//! Retry orchestrator.
//!
//! Drives one run of the batch job from trigger to its single outcome
//! notification. Every decision is appended to the run's event log before it
//! takes effect, so an interrupted run can be resumed from the log and lands
//! in the same phase it was persisted in.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    AttemptContext, CommandClassifier, ContainerExecutor, JobExecutor, Notifier, OutboxNotifier,
    WebhookNotifier,
};
use crate::config::{ClassifierConfig, ResolvedConfig};
use crate::domain::{
    Event, EventType, JobFailure, JobParameters, Notification, NotificationSettings, Outcome,
    Run, RunSpec, RunStatus,
};

use super::classifier::{ErrorClassifier, RuleClassifier};
use super::event_store::{generate_idempotency_key, EventStore};
use super::machine::Phase;
use super::timer::{Sleeper, TokioSleeper};

/// Default bound on a single classifier call
pub const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on publishing the outcome notification
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry orchestrator
pub struct Orchestrator {
    /// Directory holding one sub-directory per run
    runs_dir: PathBuf,

    executor: Arc<dyn JobExecutor>,

    classifier: Arc<dyn ErrorClassifier>,

    notifier: Arc<dyn Notifier>,

    /// Backoff timer
    sleeper: Arc<dyn Sleeper>,

    /// Topic and subjects of outcome messages
    notification: NotificationSettings,

    /// Upper bound on one classifier call
    classifier_timeout: Duration,

    /// Upper bound on publishing the outcome
    publish_timeout: Duration,
}

impl Orchestrator {
    /// Create an orchestrator over the given collaborators
    pub fn new(
        runs_dir: impl Into<PathBuf>,
        executor: Arc<dyn JobExecutor>,
        classifier: Arc<dyn ErrorClassifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            executor,
            classifier,
            notifier,
            sleeper: Arc::new(TokioSleeper),
            notification: NotificationSettings::default(),
            classifier_timeout: DEFAULT_CLASSIFIER_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_notification(mut self, notification: NotificationSettings) -> Self {
        self.notification = notification;
        self
    }

    pub fn with_classifier_timeout(mut self, timeout: Duration) -> Self {
        self.classifier_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Wire the production collaborators described by the configuration
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let command = config
            .job
            .command
            .clone()
            .context("No job command configured (set job.command in .batchflow/config.yaml)")?;

        let executor: Arc<dyn JobExecutor> = Arc::new(ContainerExecutor::new(
            command,
            config.job.args.clone(),
            Duration::from_secs(config.job.timeout_seconds),
        ));

        let classifier = classifier_from_config(&config.classifier);

        let publish_timeout = Duration::from_secs(config.notification.publish_timeout_seconds);
        let notifier: Arc<dyn Notifier> = match &config.notification.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone(), publish_timeout)?),
            None => Arc::new(OutboxNotifier::new(config.outbox_path())),
        };

        Ok(Self::new(config.runs_dir(), executor, classifier, notifier)
            .with_notification(config.notification.settings.clone())
            .with_classifier_timeout(Duration::from_secs(
                config.retry.classifier_timeout_seconds,
            ))
            .with_publish_timeout(publish_timeout))
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Start a new run and drive it to its terminal outcome.
    ///
    /// Job and classifier failures are part of the outcome; only
    /// infrastructure failures (event log I/O, lock contention) are `Err`.
    #[instrument(skip(self, params), fields(job = %params.job_name))]
    pub async fn execute(&self, params: JobParameters, max_retry_count: u32) -> Result<Outcome> {
        let run_id = Uuid::new_v4();
        info!(%run_id, max_retry_count, "Starting run");

        let store = EventStore::open(&self.runs_dir, run_id).await?;
        let _lock = store.lock()?;

        let start = Event::new(
            run_id,
            EventType::RunStarted,
            format!("Run of job '{}' started", params.job_name),
        )
        .with_data(&RunSpec {
            job: params.clone(),
            max_retry_count,
        })?;

        let mut run = Run::new(run_id, params, max_retry_count);
        run.started_at = start.timestamp;
        store.append(&start).await?;

        self.drive(&store, &mut run).await
    }

    /// Rehydrate a run from its event log and drive it to completion.
    ///
    /// A run that already published its outcome is returned untouched.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: Uuid) -> Result<Outcome> {
        let store = EventStore::open_existing(&self.runs_dir, run_id).await?;
        let _lock = store.lock()?;

        let events = store.replay().await?;
        let mut run = Run::from_events(&events).context("Failed to reconstruct run state")?;

        if run.notified {
            info!(status = %run.status(), "Run already archived");
            return Ok(run.outcome());
        }

        info!(
            phase = run.phase().name(),
            attempts = run.attempts,
            retry_count = run.retry_count(),
            "Resuming run"
        );
        self.drive(&store, &mut run).await
    }

    /// Current state of a run, rebuilt from its log
    pub async fn status(&self, run_id: Uuid) -> Result<Run> {
        load_run(&self.runs_dir, run_id).await
    }

    /// Most recent runs, newest first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        list_runs(&self.runs_dir, limit).await
    }

    async fn drive(&self, store: &EventStore, run: &mut Run) -> Result<Outcome> {
        loop {
            match run.phase().clone() {
                Phase::Running => self.attempt(store, run).await?,
                Phase::Evaluating { payload } => self.evaluate(store, run, payload).await?,
                Phase::Waiting { resume_at } => {
                    if !run.wait_scheduled {
                        self.schedule(store, run, resume_at).await?;
                    }
                    self.wait(store, run, resume_at).await?
                }
                Phase::Succeeded | Phase::Failed { .. } => break,
            }
        }

        self.finish(store, run).await
    }

    /// Invoke the executor once and record what it reported
    async fn attempt(&self, store: &EventStore, run: &mut Run) -> Result<()> {
        let attempt = run.attempts + 1;
        let key = generate_idempotency_key(run.id, attempt, &run.job.fingerprint());

        let started_event = Event::new(
            run.id,
            EventType::AttemptStarted,
            format!("Attempt {} of job '{}'", attempt, run.job.job_name),
        )
        .with_attempt(attempt, key.clone());
        self.record(store, run, started_event).await?;

        info!(attempt, executor = self.executor.name(), "Invoking job");

        let context = AttemptContext {
            run_id: run.id,
            attempt,
            idempotency_key: key.clone(),
        };
        let executor = Arc::clone(&self.executor);
        let params = run.job.clone();
        let started = Instant::now();

        let result = tokio::spawn(async move { executor.run(&params, &context).await })
            .await
            .unwrap_or_else(|e| {
                Err(JobFailure::Aborted {
                    reason: format!("executor task failed: {}", e),
                })
            });
        let duration_ms = started.elapsed().as_millis() as u64;

        let event = match result {
            Ok(output) => {
                info!(attempt, duration_ms, "Job succeeded");
                Event::new(
                    run.id,
                    EventType::AttemptSucceeded,
                    format!("Attempt {} succeeded", attempt),
                )
                .with_data(&output)?
            }
            Err(JobFailure::Task(cause)) => {
                warn!(attempt, reason = %cause.stopped_reason, "Job failed");
                let reason = cause.stopped_reason.clone();
                let payload = run.next_error_payload(cause);
                Event::new(
                    run.id,
                    EventType::AttemptFailed,
                    format!("Attempt {} failed", attempt),
                )
                .with_data(&payload)?
                .with_error(reason)
            }
            Err(JobFailure::Aborted { reason }) => {
                error!(attempt, %reason, "Job aborted");
                Event::new(
                    run.id,
                    EventType::AttemptAborted,
                    format!("Attempt {} aborted", attempt),
                )
                .with_error(reason)
            }
        };

        let event = event.with_attempt(attempt, key).with_duration(duration_ms);
        self.record(store, run, event).await
    }

    /// Ask the classifier for a verdict on the pending failure
    async fn evaluate(
        &self,
        store: &EventStore,
        run: &mut Run,
        payload: crate::domain::ErrorPayload,
    ) -> Result<()> {
        let classifier = Arc::clone(&self.classifier);
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { classifier.classify(&payload).await });

        let verdict = match tokio::time::timeout(self.classifier_timeout, &mut handle).await {
            Ok(Ok(Ok(result))) if !result.wait_time_seconds.is_finite() => Err(format!(
                "waitTimeSeconds is not a number: {}",
                result.wait_time_seconds
            )),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) => Err(format!("classifier task failed: {}", e)),
            Err(_) => {
                handle.abort();
                Err(format!(
                    "classifier '{}' timed out after {:?}",
                    self.classifier.name(),
                    self.classifier_timeout
                ))
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let event = match verdict {
            Ok(result) => {
                info!(
                    classification = %result.kind,
                    retry_count = result.retry_count,
                    wait_time_seconds = result.wait_time_seconds,
                    "Failure classified"
                );
                Event::new(
                    run.id,
                    EventType::Classified,
                    format!("Classified as {}", result.kind),
                )
                .with_data(&result)?
            }
            Err(reason) => {
                error!(%reason, "Classifier malfunction, failing run");
                Event::new(run.id, EventType::ClassifierFailed, "Classifier malfunction")
                    .with_error(reason)
            }
        };
        let event = event.with_duration(duration_ms);
        self.record(store, run, event).await
    }

    /// Record the pending wait. Also repairs a log that crashed between
    /// `classified` and `retry_scheduled`.
    async fn schedule(
        &self,
        store: &EventStore,
        run: &mut Run,
        resume_at: DateTime<Utc>,
    ) -> Result<()> {
        info!(
            retry_count = run.retry_count(),
            max_retry_count = run.max_retry_count(),
            %resume_at,
            "Retry scheduled"
        );
        let scheduled = Event::new(
            run.id,
            EventType::RetryScheduled,
            format!("Retry {} scheduled", run.retry_count()),
        )
        .with_data(&json!({
            "resumeAt": resume_at,
            "retryCount": run.retry_count(),
        }))?;
        self.record(store, run, scheduled).await
    }

    /// Sleep out the remaining backoff, then re-enter `Running`
    async fn wait(&self, store: &EventStore, run: &mut Run, resume_at: DateTime<Utc>) -> Result<()> {
        let remaining = (resume_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(remaining_ms = remaining.as_millis() as u64, "Backing off");

        self.sleeper.sleep(remaining).await;

        let resumed = Event::new(
            run.id,
            EventType::RetryResumed,
            format!("Resuming for attempt {}", run.attempts + 1),
        );
        self.record(store, run, resumed).await
    }

    /// Close the run and publish its outcome exactly once
    async fn finish(&self, store: &EventStore, run: &mut Run) -> Result<Outcome> {
        if !run.closed {
            let event = match run.status() {
                RunStatus::Succeeded => {
                    info!(attempts = run.attempts, "Run succeeded");
                    Event::new(run.id, EventType::RunSucceeded, "Run succeeded")
                }
                _ => {
                    let reason = run
                        .failure_reason()
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    error!(attempts = run.attempts, %reason, "Run failed");
                    Event::new(run.id, EventType::RunFailed, "Run failed").with_error(reason)
                }
            };
            self.record(store, run, event).await?;
        }

        let outcome = run.outcome();

        if !run.notified {
            let notification = Notification::for_outcome(&self.notification, &outcome, &run.job)?;

            let mut event = Event::new(
                run.id,
                EventType::NotificationSent,
                format!("Published '{}' to {}", notification.subject, notification.topic),
            )
            .with_data(&json!({
                "topic": notification.topic,
                "subject": notification.subject,
                "notifier": self.notifier.name(),
            }))?;

            let published = tokio::time::timeout(
                self.publish_timeout,
                self.notifier.publish(
                    &notification.topic,
                    &notification.subject,
                    &notification.message,
                ),
            )
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!(
                    "publish timed out after {:?}",
                    self.publish_timeout
                ))
            });

            match published {
                Ok(()) => info!(subject = %notification.subject, "Outcome published"),
                Err(e) => {
                    error!(error = %e, notifier = self.notifier.name(), "Failed to publish outcome");
                    event = event.with_error(format!("{:#}", e));
                }
            }

            self.record(store, run, event).await?;
        }

        Ok(outcome)
    }

    /// Validate an event against the run, persist it, then commit it.
    ///
    /// Going through `apply_event` keeps live state identical to replayed state.
    async fn record(&self, store: &EventStore, run: &mut Run, event: Event) -> Result<()> {
        let mut next = run.clone();
        next.apply_event(&event)?;
        store.append(&event).await?;
        *run = next;
        Ok(())
    }
}

/// External classifier program when one is configured, the rule set otherwise
pub fn classifier_from_config(config: &ClassifierConfig) -> Arc<dyn ErrorClassifier> {
    match &config.command {
        Some(command) => Arc::new(CommandClassifier::new(command.clone(), config.args.clone())),
        None => Arc::new(RuleClassifier::new(config.rules.clone())),
    }
}

/// Rebuild a single run from its log
pub async fn load_run(runs_dir: &Path, run_id: Uuid) -> Result<Run> {
    let store = EventStore::open_existing(runs_dir, run_id).await?;
    let events = store.replay().await?;
    Run::from_events(&events).with_context(|| format!("Failed to load run {}", run_id))
}

/// Load the most recent runs, newest first.
///
/// Runs whose log cannot be replayed are skipped with a warning.
pub async fn list_runs(runs_dir: &Path, limit: usize) -> Result<Vec<Run>> {
    let mut runs = Vec::new();

    for run_id in EventStore::list_runs(runs_dir).await? {
        match load_run(runs_dir, run_id).await {
            Ok(run) => runs.push(run),
            Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::ClassifierError;
    use crate::domain::{ClassificationResult, ErrorPayload, TaskFailure};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobExecutor for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(
            &self,
            _params: &JobParameters,
            _attempt: &AttemptContext,
        ) -> std::result::Result<serde_json::Value, JobFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(JobFailure::Task(TaskFailure::new("CannotPullContainerError")))
            } else {
                Ok(json!({ "exitCode": 0 }))
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        subjects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn publish(&self, _topic: &str, subject: &str, _message: &str) -> Result<()> {
            self.subjects.lock().unwrap().push(subject.to_string());
            Ok(())
        }
    }

    struct NoWait;

    #[async_trait]
    impl Sleeper for NoWait {
        async fn sleep(&self, _duration: Duration) {}
    }

    struct Always(ClassificationResult);

    #[async_trait]
    impl ErrorClassifier for Always {
        fn name(&self) -> &str {
            "always"
        }

        async fn classify(
            &self,
            _payload: &ErrorPayload,
        ) -> std::result::Result<ClassificationResult, ClassifierError> {
            Ok(self.0.clone())
        }
    }

    fn orchestrator(
        dir: &Path,
        executor: Arc<dyn JobExecutor>,
        classifier: Arc<dyn ErrorClassifier>,
        notifier: Arc<Recorder>,
    ) -> Orchestrator {
        Orchestrator::new(dir, executor, classifier, notifier).with_sleeper(Arc::new(NoWait))
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let temp = TempDir::new().unwrap();
        let notifier = Arc::new(Recorder::default());
        let orch = orchestrator(
            temp.path(),
            Arc::new(Flaky {
                failures: 0,
                calls: AtomicU32::new(0),
            }),
            Arc::new(RuleClassifier::default()),
            notifier.clone(),
        );

        let outcome = orch
            .execute(JobParameters::new("fileDownloadJob"), 3)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            *notifier.subjects.lock().unwrap(),
            vec!["Task successfully processed.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_log_replays_to_final_state() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(
            temp.path(),
            Arc::new(Flaky {
                failures: 2,
                calls: AtomicU32::new(0),
            }),
            Arc::new(RuleClassifier::default()),
            Arc::new(Recorder::default()),
        );

        let outcome = orch.execute(JobParameters::new("job"), 3).await.unwrap();
        let run = orch.status(outcome.run_id).await.unwrap();

        assert_eq!(run.outcome(), outcome);
        assert!(run.closed);
        assert!(run.notified);
    }

    #[tokio::test]
    async fn test_fatal_verdict_stops_immediately() {
        let temp = TempDir::new().unwrap();
        let executor = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let notifier = Arc::new(Recorder::default());
        let orch = orchestrator(
            temp.path(),
            executor.clone(),
            Arc::new(Always(ClassificationResult::fatal(0))),
            notifier.clone(),
        );

        let outcome = orch.execute(JobParameters::new("job"), 3).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *notifier.subjects.lock().unwrap(),
            vec!["Task failed".to_string()]
        );
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(
            temp.path(),
            Arc::new(Flaky {
                failures: 0,
                calls: AtomicU32::new(0),
            }),
            Arc::new(RuleClassifier::default()),
            Arc::new(Recorder::default()),
        );

        let first = orch.execute(JobParameters::new("job"), 3).await.unwrap();
        let second = orch.execute(JobParameters::new("job"), 3).await.unwrap();

        let runs = orch.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.run_id);
        assert_eq!(runs[1].id, first.run_id);

        assert_eq!(orch.list_runs(1).await.unwrap().len(), 1);
    }
}
