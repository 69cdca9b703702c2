//! Hand-written fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use batchflow::adapters::{AttemptContext, JobExecutor, Notifier};
use batchflow::core::{ClassifierError, ErrorClassifier, Orchestrator, RuleClassifier, Sleeper};
use batchflow::domain::{ClassificationResult, ErrorPayload, JobFailure, JobParameters, TaskFailure};

/// Executor replaying a fixed list of results, succeeding once exhausted
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<std::result::Result<Value, JobFailure>>>,
    pub calls: Mutex<Vec<(JobParameters, AttemptContext)>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<std::result::Result<Value, JobFailure>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails with a retryable-looking stop reason `n` times, then succeeds
    pub fn failing(n: usize) -> Self {
        Self::new((0..n).map(|_| Err(pull_error())).collect())
    }

    /// Fails on every call
    pub fn always_failing() -> Self {
        Self::new((0..64).map(|_| Err(pull_error())).collect())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn pull_error() -> JobFailure {
    JobFailure::Task(TaskFailure::new(
        "CannotPullContainerError: pull access denied",
    ))
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        params: &JobParameters,
        attempt: &AttemptContext,
    ) -> std::result::Result<Value, JobFailure> {
        self.calls
            .lock()
            .unwrap()
            .push((params.clone(), attempt.clone()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "exitCode": 0 })))
    }
}

/// How a scripted classifier answers one call
pub enum Verdict {
    Result(ClassificationResult),
    Error,
    Panic,
    Hang,
}

/// Classifier replaying a fixed list of verdicts, fatal once exhausted
#[derive(Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Verdict>>,
    pub payloads: Mutex<Vec<ErrorPayload>>,
}

impl ScriptedClassifier {
    pub fn new(script: Vec<Verdict>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl ErrorClassifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(
        &self,
        payload: &ErrorPayload,
    ) -> std::result::Result<ClassificationResult, ClassifierError> {
        self.payloads.lock().unwrap().push(payload.clone());
        let verdict = self.script.lock().unwrap().pop_front();
        match verdict {
            Some(Verdict::Result(result)) => Ok(result),
            Some(Verdict::Error) => Err(ClassifierError::Invocation("scripted failure".into())),
            Some(Verdict::Panic) => panic!("classifier exploded"),
            Some(Verdict::Hang) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(ClassificationResult::retryable(0, 0.0))
            }
            None => Ok(ClassificationResult::fatal(0)),
        }
    }
}

/// Real rule classifier that remembers what it was asked
#[derive(Default)]
pub struct CountingClassifier {
    inner: RuleClassifier,
    pub payloads: Mutex<Vec<ErrorPayload>>,
}

impl CountingClassifier {
    pub fn call_count(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl ErrorClassifier for CountingClassifier {
    fn name(&self) -> &str {
        "counting"
    }

    async fn classify(
        &self,
        payload: &ErrorPayload,
    ) -> std::result::Result<ClassificationResult, ClassifierError> {
        self.payloads.lock().unwrap().push(payload.clone());
        self.inner.evaluate(payload)
    }
}

/// Notifier recording `(topic, subject, message)` triples
#[derive(Default)]
pub struct RecordingNotifier {
    pub published: Mutex<Vec<(String, String, String)>>,
    pub fail: bool,
    pub hang: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Records the message, then never returns
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, subject, _)| subject.clone())
            .collect()
    }

    pub fn last_message(&self) -> Value {
        let published = self.published.lock().unwrap();
        let (_, _, message) = published.last().expect("nothing published");
        serde_json::from_str(message).unwrap()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(&self, topic: &str, subject: &str, message: &str) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), subject.to_string(), message.to_string()));
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        if self.fail {
            anyhow::bail!("broker unavailable");
        }
        Ok(())
    }
}

/// Sleeper that returns immediately and records requested waits
#[derive(Default)]
pub struct RecordingSleeper {
    pub waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}

/// Everything a test needs to inspect after driving a run
pub struct Harness<C> {
    pub orchestrator: Orchestrator,
    pub executor: Arc<ScriptedExecutor>,
    pub classifier: Arc<C>,
    pub notifier: Arc<RecordingNotifier>,
    pub sleeper: Arc<RecordingSleeper>,
}

pub fn harness<C: ErrorClassifier + 'static>(
    runs_dir: &Path,
    executor: ScriptedExecutor,
    classifier: C,
    notifier: RecordingNotifier,
) -> Harness<C> {
    let executor = Arc::new(executor);
    let classifier = Arc::new(classifier);
    let notifier = Arc::new(notifier);
    let sleeper = Arc::new(RecordingSleeper::default());

    let orchestrator = Orchestrator::new(
        runs_dir,
        executor.clone(),
        classifier.clone(),
        notifier.clone(),
    )
    .with_sleeper(sleeper.clone())
    .with_classifier_timeout(Duration::from_millis(200))
    .with_publish_timeout(Duration::from_millis(200));

    Harness {
        orchestrator,
        executor,
        classifier,
        notifier,
        sleeper,
    }
}

pub fn file_download_job() -> JobParameters {
    JobParameters::new("fileDownloadJob")
        .with_value("BUCKET_NAME", "incoming")
        .with_value("FILE_KEY", "test.txt")
}
