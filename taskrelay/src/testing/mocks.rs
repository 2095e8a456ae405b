//! Scripted stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ResilienceError, Result};
use crate::pipeline::{PipelineStage, StageInput, StageResult, Task};
use crate::retry::RetryConfig;

/// Shared, ordered log of stage calls across a whole pipeline.
///
/// Entries look like `execute:download` and `compensate:download`.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// All entries in call order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries starting with `prefix`, e.g. `"compensate:"`.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// A stage that replays a scripted list of results.
///
/// Each call pops the next scripted result; once the script is exhausted
/// every further call returns the fallback (success with the stage name by
/// default).
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    script: Mutex<VecDeque<Result<serde_json::Value>>>,
    fallback: Result<serde_json::Value>,
    compensation_error: Option<ResilienceError>,
    delay: Option<Duration>,
    retry_config: Option<RetryConfig>,
    guarded: bool,
    timeout: Option<Duration>,
    log: Option<CallLog>,
    calls: AtomicUsize,
    compensations: AtomicUsize,
}

impl ScriptedStage {
    /// Creates a stage that always succeeds with its own name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            fallback: Ok(serde_json::json!(name)),
            name,
            script: Mutex::new(VecDeque::new()),
            compensation_error: None,
            delay: None,
            retry_config: None,
            guarded: false,
            timeout: None,
            log: None,
            calls: AtomicUsize::new(0),
            compensations: AtomicUsize::new(0),
        }
    }

    /// Queues a successful result.
    #[must_use]
    pub fn then_ok(self, value: serde_json::Value) -> Self {
        self.script.lock().push_back(Ok(value));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn then_err(self, error: ResilienceError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Queues `count` transient failures.
    #[must_use]
    pub fn failing_transiently(self, count: usize) -> Self {
        for attempt in 1..=count {
            let error = ResilienceError::transient(self.name.clone(), format!("scripted failure {attempt}"));
            self.script.lock().push_back(Err(error));
        }
        self
    }

    /// Sets what every call returns after the script runs out.
    #[must_use]
    pub fn otherwise(mut self, result: Result<serde_json::Value>) -> Self {
        self.fallback = result;
        self
    }

    /// Makes every call fail with `error` once the script runs out.
    #[must_use]
    pub fn always_failing(self, error: ResilienceError) -> Self {
        self.otherwise(Err(error))
    }

    /// Makes compensation fail.
    #[must_use]
    pub fn with_failing_compensation(mut self, error: ResilienceError) -> Self {
        self.compensation_error = Some(error);
        self
    }

    /// Sleeps before answering each call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets a stage-specific retry policy.
    #[must_use]
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    /// Routes calls through the circuit breaker.
    #[must_use]
    pub fn guarded(mut self) -> Self {
        self.guarded = true;
        self
    }

    /// Limits each attempt.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Writes calls to a shared log.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of `execute` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `compensate` calls so far.
    #[must_use]
    pub fn compensations(&self) -> usize {
        self.compensations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineStage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn retry_config(&self) -> Option<RetryConfig> {
        self.retry_config.clone()
    }

    fn guarded(&self) -> bool {
        self.guarded
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, _input: &StageInput) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.push(format!("execute:{}", self.name));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    async fn compensate(&self, _task: &Task, _result: &StageResult) -> Result<()> {
        self.compensations.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.push(format!("compensate:{}", self.name));
        }
        match &self.compensation_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// What a [`RecordingStage`] saw on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInput {
    /// Task id.
    pub task_id: String,
    /// Stage position.
    pub index: usize,
    /// Data received from the previous stage.
    pub previous: Option<serde_json::Value>,
}

/// A stage that succeeds, records its inputs and appends its name to the
/// array it received, so the last output lists every stage in order.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    inputs: Mutex<Vec<RecordedInput>>,
    log: Option<CallLog>,
}

impl RecordingStage {
    /// Creates a recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Mutex::new(Vec::new()),
            log: None,
        }
    }

    /// Writes calls to a shared log.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Inputs seen so far.
    #[must_use]
    pub fn inputs(&self) -> Vec<RecordedInput> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl PipelineStage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &StageInput) -> Result<serde_json::Value> {
        self.inputs.lock().push(RecordedInput {
            task_id: input.task.id.clone(),
            index: input.index,
            previous: input.previous.clone(),
        });
        if let Some(log) = &self.log {
            log.push(format!("execute:{}", self.name));
        }

        let mut trail = input
            .previous
            .as_ref()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        trail.push(serde_json::json!(self.name));
        Ok(serde_json::Value::Array(trail))
    }

    async fn compensate(&self, _task: &Task, _result: &StageResult) -> Result<()> {
        if let Some(log) = &self.log {
            log.push(format!("compensate:{}", self.name));
        }
        Ok(())
    }
}
