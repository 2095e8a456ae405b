//! Pipeline stages.
//!
//! A stage is one external call in the fixed sequence (acquire, transform,
//! annotate, publish...). It receives the previous stage's output and may
//! provide a compensation that undoes its side effect.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::Task;
use crate::errors::{ResilienceError, Result};
use crate::retry::RetryConfig;

/// How many recent task winners a [`FallbackStage`] remembers for
/// compensation. Runs are single-flight, so only the newest few matter.
const WINNER_HISTORY: usize = 8;

/// What a stage receives.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// The task being processed.
    pub task: Task,
    /// Zero-based stage position.
    pub index: usize,
    /// Output of the previous stage; `None` for the first stage.
    pub previous: Option<serde_json::Value>,
}

/// Output of a completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage: String,
    /// Produced data, passed to the next stage.
    pub data: serde_json::Value,
}

/// One step of the pipeline.
///
/// `execute` may be invoked several times for the same input (retries), so it
/// must be safe to repeat after a failure.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stage name; also the retry operation and breaker key.
    fn name(&self) -> &str;

    /// Stage-specific retry policy. `None` uses the orchestrator default.
    fn retry_config(&self) -> Option<RetryConfig> {
        None
    }

    /// Whether calls go through the circuit breaker.
    fn guarded(&self) -> bool {
        false
    }

    /// Per-attempt time limit. Exceeding it counts as a transient failure.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Performs the stage.
    async fn execute(&self, input: &StageInput) -> Result<serde_json::Value>;

    /// Undoes the external effect of a completed `execute`.
    async fn compensate(&self, _task: &Task, _result: &StageResult) -> Result<()> {
        Ok(())
    }
}

/// Shared stage handle.
pub type SharedStage = Arc<dyn PipelineStage>;

type ExecuteFn = Arc<dyn Fn(StageInput) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;
type CompensateFn = Arc<dyn Fn(Task, StageResult) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A stage built from closures.
#[derive(Clone)]
pub struct FnStage {
    name: String,
    execute: ExecuteFn,
    compensate: Option<CompensateFn>,
    retry_config: Option<RetryConfig>,
    guarded: bool,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("has_compensation", &self.compensate.is_some())
            .field("guarded", &self.guarded)
            .finish()
    }
}

impl FnStage {
    /// Creates a stage from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(StageInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |input| Box::pin(execute(input))),
            compensate: None,
            retry_config: None,
            guarded: false,
            timeout: None,
        }
    }

    /// Adds a compensation closure.
    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(Task, StageResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |task, result| Box::pin(compensate(task, result))));
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
}

#[async_trait]
impl PipelineStage for FnStage {
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

    async fn execute(&self, input: &StageInput) -> Result<serde_json::Value> {
        (self.execute)(input.clone()).await
    }

    async fn compensate(&self, task: &Task, result: &StageResult) -> Result<()> {
        match &self.compensate {
            Some(compensate) => compensate(task.clone(), result.clone()).await,
            None => Ok(()),
        }
    }
}

/// Ordered alternative implementations of one stage.
///
/// Within a single attempt the alternatives are tried in order and the first
/// success wins. If all fail, the last retriable error is returned (so the
/// retry executor tries the chain again), or the last error if none was
/// retriable. Compensation is delegated to whichever alternative produced the
/// task's result, for the most recent tasks the chain has served.
pub struct FallbackStage {
    name: String,
    alternatives: Vec<SharedStage>,
    retry_config: Option<RetryConfig>,
    guarded: bool,
    timeout: Option<Duration>,
    winners: Mutex<VecDeque<(String, usize)>>,
}

impl std::fmt::Debug for FallbackStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.alternatives.iter().map(|a| a.name()).collect();
        f.debug_struct("FallbackStage")
            .field("name", &self.name)
            .field("alternatives", &names)
            .finish()
    }
}

impl FallbackStage {
    /// Creates an empty chain.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alternatives: Vec::new(),
            retry_config: None,
            guarded: false,
            timeout: None,
            winners: Mutex::new(VecDeque::with_capacity(WINNER_HISTORY)),
        }
    }

    /// Appends an alternative; earlier alternatives are preferred.
    #[must_use]
    pub fn alternative(mut self, stage: impl PipelineStage + 'static) -> Self {
        self.alternatives.push(Arc::new(stage));
        self
    }

    /// Sets a chain-wide retry policy.
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

    /// Limits each attempt of the whole chain.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of alternatives.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alternatives.len()
    }

    /// True if the chain has no alternatives.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }

    fn remember_winner(&self, task_id: &str, position: usize) {
        let mut winners = self.winners.lock();
        winners.retain(|(id, _)| id != task_id);
        winners.push_back((task_id.to_string(), position));
        while winners.len() > WINNER_HISTORY {
            winners.pop_front();
        }
    }

    fn take_winner(&self, task_id: &str) -> Option<usize> {
        let mut winners = self.winners.lock();
        let slot = winners.iter().position(|(id, _)| id == task_id)?;
        winners.remove(slot).map(|(_, position)| position)
    }
}

#[async_trait]
impl PipelineStage for FallbackStage {
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

    async fn execute(&self, input: &StageInput) -> Result<serde_json::Value> {
        let mut last_error: Option<ResilienceError> = None;
        let mut last_retriable: Option<ResilienceError> = None;

        for (position, alternative) in self.alternatives.iter().enumerate() {
            match alternative.execute(input).await {
                Ok(value) => {
                    self.remember_winner(&input.task.id, position);
                    return Ok(value);
                }
                Err(err) => {
                    debug!(
                        stage = %self.name,
                        alternative = alternative.name(),
                        error = %err,
                        "Alternative failed, trying next"
                    );
                    if err.is_retriable() {
                        last_retriable = Some(err.clone());
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_retriable.or(last_error).unwrap_or_else(|| {
            ResilienceError::permanent(self.name.clone(), "no alternatives configured")
        }))
    }

    async fn compensate(&self, task: &Task, result: &StageResult) -> Result<()> {
        let winner = self.take_winner(&task.id);
        match winner.and_then(|position| self.alternatives.get(position)) {
            Some(alternative) => alternative.compensate(task, result).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn input() -> StageInput {
        StageInput {
            task: Task::new("T1", "clip"),
            index: 0,
            previous: None,
        }
    }

    #[tokio::test]
    async fn test_fn_stage_executes_and_compensates() {
        let undone = Arc::new(AtomicUsize::new(0));
        let counter = undone.clone();
        let stage = FnStage::new("download", |input: StageInput| async move {
            Ok(serde_json::json!({ "path": format!("/tmp/{}.mp4", input.task.id) }))
        })
        .with_compensation(move |_task, _result| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let data = stage.execute(&input()).await.unwrap();
        assert_eq!(data["path"], "/tmp/T1.mp4");

        let result = StageResult {
            stage: "download".to_string(),
            data,
        };
        stage.compensate(&input().task, &result).await.unwrap();
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_uses_first_success() {
        let chain = FallbackStage::new("publish")
            .alternative(FnStage::new("api", |_| async {
                Err(ResilienceError::transient("api", "quota"))
            }))
            .alternative(FnStage::new("browser", |_| async { Ok(serde_json::json!("via-browser")) }))
            .alternative(FnStage::new("never", |_| async { Ok(serde_json::json!("unused")) }));

        assert_eq!(chain.len(), 3);
        let value = chain.execute(&input()).await.unwrap();
        assert_eq!(value, serde_json::json!("via-browser"));
    }

    #[tokio::test]
    async fn test_fallback_prefers_retriable_error() {
        let chain = FallbackStage::new("publish")
            .alternative(FnStage::new("api", |_| async {
                Err(ResilienceError::transient("api", "503"))
            }))
            .alternative(FnStage::new("legacy", |_| async {
                Err(ResilienceError::permanent("legacy", "unsupported format"))
            }));

        let err = chain.execute(&input()).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_empty_fallback_is_permanent_failure() {
        let chain = FallbackStage::new("publish");
        assert!(chain.is_empty());
        let err = chain.execute(&input()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::PermanentValidation { .. }));
    }

    #[tokio::test]
    async fn test_fallback_compensates_winner_only() {
        let first_undone = Arc::new(AtomicUsize::new(0));
        let second_undone = Arc::new(AtomicUsize::new(0));
        let (a, b) = (first_undone.clone(), second_undone.clone());

        let chain = FallbackStage::new("upload")
            .alternative(
                FnStage::new("primary", |_| async { Err(ResilienceError::transient("primary", "down")) })
                    .with_compensation(move |_, _| {
                        let a = a.clone();
                        async move {
                            a.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
            )
            .alternative(
                FnStage::new("secondary", |_| async { Ok(serde_json::json!("id-2")) })
                    .with_compensation(move |_, _| {
                        let b = b.clone();
                        async move {
                            b.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
            );

        let data = chain.execute(&input()).await.unwrap();
        let result = StageResult {
            stage: "upload".to_string(),
            data,
        };
        chain.compensate(&input().task, &result).await.unwrap();

        assert_eq!(first_undone.load(Ordering::SeqCst), 0);
        assert_eq!(second_undone.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_winner_history_is_bounded() {
        let undone = Arc::new(AtomicUsize::new(0));
        let counter = undone.clone();
        let chain = FallbackStage::new("publish").alternative(
            FnStage::new("api", |_| async { Ok(serde_json::json!("posted")) }).with_compensation(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        for n in 0..1000 {
            let input = StageInput {
                task: Task::new(format!("T{n}"), "clip"),
                index: 0,
                previous: None,
            };
            chain.execute(&input).await.unwrap();
        }
        assert_eq!(chain.winners.lock().len(), WINNER_HISTORY);

        let result = StageResult {
            stage: "publish".to_string(),
            data: serde_json::json!("posted"),
        };
        chain.compensate(&Task::new("T999", "clip"), &result).await.unwrap();
        chain.compensate(&Task::new("T0", "clip"), &result).await.unwrap();
        assert_eq!(undone.load(Ordering::SeqCst), 1);
        assert_eq!(chain.winners.lock().len(), WINNER_HISTORY - 1);
    }
}
