//! Single-flight pipeline orchestrator.
//!
//! One run at a time: select the first unsettled task, drive it through every
//! stage in order, compensate completed stages if anything goes wrong, then
//! write exactly one ledger record.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::RunState;
use super::{
    OrchestratorStatus, PipelinePhase, PipelineStage, RunOutcome, SharedStage, StageInput,
    StageResult, Task, TaskSource, TriggerResponse,
};
use crate::cancellation::CancellationToken;
use crate::circuit::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::errors::{ResilienceError, Result};
use crate::events::{default_sink, EventLevel, ResilienceEvent, SharedEventSink};
use crate::ledger::{LedgerRecord, ProcessingLedger};
use crate::retry::{RetryConfig, RetryExecutor};

const COMPONENT: &str = "pipeline";

/// Error text recorded for runs ended by [`PipelineOrchestrator::stop`].
pub const STOPPED_MESSAGE: &str = "Manually stopped";

struct Inner {
    source: Arc<dyn TaskSource>,
    ledger: Arc<dyn ProcessingLedger>,
    stages: Vec<SharedStage>,
    executor: RetryExecutor,
    breakers: Arc<CircuitBreakerRegistry>,
    default_retry: RetryConfig,
    sink: SharedEventSink,
    state: Mutex<RunState>,
}

/// The single-flight lock held by one run.
///
/// Dropping the lease gives the lock back if the run still owns it, so a run
/// whose future is dropped or whose task panics cannot leave the
/// orchestrator busy.
struct RunLease {
    inner: Arc<Inner>,
    run_id: Uuid,
    token: Arc<CancellationToken>,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.owned_by(self.run_id) {
            state.release();
            drop(state);
            warn!(run_id = %self.run_id, "Run abandoned before finishing, lock released");
            self.inner.emit(
                ResilienceEvent::new(COMPONENT, "pipeline.run_abandoned")
                    .with_level(EventLevel::Warn)
                    .with_field("run_id", self.run_id.to_string()),
            );
        }
    }
}

/// Drives tasks through the configured stages, one run at a time.
///
/// Cloning is cheap and every clone shares the same single-flight lock.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<&str> = self.inner.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &stages)
            .field("in_flight", &self.inner.state.lock().in_flight)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Starts building an orchestrator over `source` and `ledger`.
    pub fn builder(
        source: Arc<dyn TaskSource>,
        ledger: Arc<dyn ProcessingLedger>,
    ) -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder::new(source, ledger)
    }

    /// Starts a run in the background, or reports that one is in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_once(&self) -> TriggerResponse {
        let Some(lease) = Inner::try_begin(&self.inner) else {
            return TriggerResponse::Busy;
        };

        let run_id = lease.run_id;
        tokio::spawn(async move {
            Inner::execute(lease).await;
        });
        TriggerResponse::Accepted { run_id }
    }

    /// Runs to completion and returns the outcome.
    ///
    /// Fails with [`ResilienceError::Busy`] if a run is already in flight.
    /// Dropping the returned future releases the single-flight lock.
    pub async fn run_now(&self) -> Result<RunOutcome> {
        let lease = Inner::try_begin(&self.inner).ok_or(ResilienceError::Busy)?;
        Ok(Inner::execute(lease).await)
    }

    /// Requests cancellation of the current run and releases the
    /// single-flight lock. Returns whether a run was in flight.
    ///
    /// The in-flight stage call is not interrupted; its result is discarded
    /// once it completes and no further attempts are made. If a newer run
    /// starts before the stopped one winds down, the stopped run leaves the
    /// ledger and the reported last outcome to the newer run.
    pub fn stop(&self) -> bool {
        let (run_id, token) = {
            let mut state = self.inner.state.lock();
            if !state.in_flight {
                return false;
            }
            let run_id = state.run_id;
            (run_id, state.release())
        };

        if let Some(token) = token {
            token.cancel(STOPPED_MESSAGE);
        }
        info!(run_id = ?run_id, "Stop requested");
        self.inner.emit(
            ResilienceEvent::new(COMPONENT, "pipeline.stop_requested")
                .with_field("run_id", run_id.map(|id| id.to_string())),
        );
        true
    }

    /// Snapshot of the orchestrator state.
    #[must_use]
    pub fn status(&self) -> OrchestratorStatus {
        self.inner.state.lock().status()
    }

    /// True while a run holds the single-flight lock.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().in_flight
    }

    /// Records `task_id` as failed for good so selection skips it.
    pub async fn mark_permanently_failed(&self, task_id: &str, reason: &str) -> Result<()> {
        let record = LedgerRecord::failed(task_id, reason).permanent();
        self.inner.ledger.record(task_id, record).await?;
        warn!(task_id, reason, "Task marked as permanently failed");
        self.inner.emit(
            ResilienceEvent::new("ledger", "ledger.recorded")
                .with_field("task_id", task_id)
                .with_field("success", false)
                .with_field("permanent_failure", true),
        );
        Ok(())
    }

    /// The ledger this orchestrator writes to.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn ProcessingLedger> {
        &self.inner.ledger
    }

    /// The breaker registry guarding flagged stages.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.inner.stages.iter().map(|s| s.name().to_string()).collect()
    }
}

impl Inner {
    fn emit(&self, event: ResilienceEvent) {
        self.sink.emit(event);
    }

    fn try_begin(this: &Arc<Self>) -> Option<RunLease> {
        let mut state = this.state.lock();
        if state.in_flight {
            drop(state);
            debug!("Trigger rejected, run in flight");
            this.emit(ResilienceEvent::new(COMPONENT, "pipeline.busy").with_level(EventLevel::Debug));
            return None;
        }

        let run_id = Uuid::new_v4();
        let token = Arc::new(CancellationToken::new());
        state.in_flight = true;
        state.phase = PipelinePhase::Selecting;
        state.current_task = None;
        state.run_id = Some(run_id);
        state.latest_run = Some(run_id);
        state.cancel = Some(token.clone());
        Some(RunLease {
            inner: this.clone(),
            run_id,
            token,
        })
    }

    fn set_phase(&self, run_id: Uuid, phase: PipelinePhase) {
        let mut state = self.state.lock();
        if state.owned_by(run_id) {
            state.phase = phase;
        }
    }

    fn set_current_task(&self, run_id: Uuid, task_id: &str) {
        let mut state = self.state.lock();
        if state.owned_by(run_id) {
            state.current_task = Some(task_id.to_string());
        }
    }

    async fn execute(lease: RunLease) -> RunOutcome {
        let run_id = lease.run_id;
        let this = &lease.inner;
        info!(%run_id, "Pipeline run started");
        this.emit(
            ResilienceEvent::new(COMPONENT, "pipeline.run_started").with_field("run_id", run_id.to_string()),
        );

        let outcome = this.drive(run_id, &lease.token).await;

        {
            let mut state = this.state.lock();
            // A stopped run may finish after a newer run started.
            if state.is_latest(run_id) {
                state.last_outcome = Some(outcome.clone());
                state.last_run_at = Some(Utc::now());
            }
            if state.owned_by(run_id) {
                state.release();
            }
        }

        info!(%run_id, outcome = outcome.label(), task_id = ?outcome.task_id(), "Pipeline run finished");
        let level = match &outcome {
            RunOutcome::Failed { .. } | RunOutcome::Aborted { .. } => EventLevel::Error,
            RunOutcome::Stopped { .. } => EventLevel::Warn,
            RunOutcome::Succeeded { .. } | RunOutcome::NoCandidate => EventLevel::Info,
        };
        this.emit(
            ResilienceEvent::new(COMPONENT, "pipeline.run_completed")
                .with_level(level)
                .with_field("run_id", run_id.to_string())
                .with_field("outcome", outcome.label())
                .with_field("task_id", outcome.task_id().map(str::to_string)),
        );
        outcome
    }

    async fn drive(&self, run_id: Uuid, token: &CancellationToken) -> RunOutcome {
        let task = match self.select().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("No unprocessed candidates");
                self.emit(ResilienceEvent::new(COMPONENT, "pipeline.no_candidate"));
                return RunOutcome::NoCandidate;
            }
            Err(error) => {
                warn!(error = %error, "Candidate selection failed");
                return RunOutcome::Aborted { task_id: None, error };
            }
        };

        self.set_current_task(run_id, &task.id);
        info!(task_id = %task.id, task_name = %task.name, "Task selected");
        self.emit(
            ResilienceEvent::new(COMPONENT, "pipeline.task_selected")
                .with_field("task_id", task.id.as_str())
                .with_field("task_name", task.name.as_str()),
        );

        let mut completed: Vec<(SharedStage, StageResult)> = Vec::with_capacity(self.stages.len());
        let mut failure: Option<(usize, String, ResilienceError)> = None;

        for (index, stage) in self.stages.iter().enumerate() {
            if token.is_cancelled() {
                break;
            }

            let name = stage.name().to_string();
            self.set_phase(
                run_id,
                PipelinePhase::Running {
                    index,
                    stage: name.clone(),
                },
            );
            self.emit(
                ResilienceEvent::new(COMPONENT, "pipeline.stage_started")
                    .with_field("task_id", task.id.as_str())
                    .with_field("stage", name.as_str())
                    .with_field("index", index),
            );

            let input = StageInput {
                task: task.clone(),
                index,
                previous: completed.last().map(|(_, result)| result.data.clone()),
            };

            match self.run_stage(stage, &input, token).await {
                Ok(data) => {
                    info!(task_id = %task.id, stage = %name, index, "Stage completed");
                    self.emit(
                        ResilienceEvent::new(COMPONENT, "pipeline.stage_completed")
                            .with_field("task_id", task.id.as_str())
                            .with_field("stage", name.as_str())
                            .with_field("index", index),
                    );
                    completed.push((stage.clone(), StageResult { stage: name, data }));
                }
                Err(ResilienceError::Cancelled(_)) => break,
                Err(error) => {
                    warn!(task_id = %task.id, stage = %name, index, error = %error, "Stage failed");
                    self.emit(
                        ResilienceEvent::new(COMPONENT, "pipeline.stage_failed")
                            .with_level(EventLevel::Error)
                            .with_field("task_id", task.id.as_str())
                            .with_field("stage", name.as_str())
                            .with_field("index", index)
                            .with_field("error", error.to_string())
                            .with_field("error_type", error.root_cause().kind()),
                    );
                    failure = Some((index, name, error));
                    break;
                }
            }
        }

        let stopped = token.is_cancelled();
        if stopped || failure.is_some() {
            self.set_phase(run_id, PipelinePhase::Cleaning);
            self.compensate(&task, &completed).await;
        }

        self.set_phase(run_id, PipelinePhase::Recording);
        let (record, outcome) = if stopped {
            info!(task_id = %task.id, "Run stopped");
            self.emit(
                ResilienceEvent::new(COMPONENT, "pipeline.stopped")
                    .with_level(EventLevel::Warn)
                    .with_field("task_id", task.id.as_str())
                    .with_field("completed_stages", completed.len()),
            );
            (
                LedgerRecord::failed(&task.id, STOPPED_MESSAGE),
                RunOutcome::Stopped {
                    task_id: task.id.clone(),
                },
            )
        } else if let Some((stage_index, stage, error)) = failure {
            let record = LedgerRecord::failed(
                &task.id,
                ResilienceError::stage(stage_index, stage.as_str(), error.clone()).to_string(),
            )
            .with_metadata("stage", serde_json::json!(stage))
            .with_metadata("stage_index", serde_json::json!(stage_index))
            .with_metadata("error_type", serde_json::json!(error.root_cause().kind()));
            (
                record,
                RunOutcome::Failed {
                    task_id: task.id.clone(),
                    stage_index,
                    stage,
                    error,
                },
            )
        } else {
            let results: Vec<StageResult> = completed.into_iter().map(|(_, result)| result).collect();
            let mut metadata = serde_json::Map::new();
            metadata.insert("task_name".to_string(), serde_json::json!(task.name));
            for result in &results {
                metadata.insert(result.stage.clone(), result.data.clone());
            }
            (
                LedgerRecord::succeeded(&task.id, metadata),
                RunOutcome::Succeeded {
                    task_id: task.id.clone(),
                    results,
                },
            )
        };

        if stopped && !self.may_record_stop(run_id, &task.id).await {
            info!(task_id = %task.id, %run_id, "Stopped run superseded, leaving ledger untouched");
            self.emit(
                ResilienceEvent::new(COMPONENT, "pipeline.stop_record_skipped")
                    .with_field("task_id", task.id.as_str())
                    .with_field("run_id", run_id.to_string()),
            );
            return outcome;
        }

        let success = record.success;
        if let Err(error) = self.ledger.record(&task.id, record).await {
            warn!(task_id = %task.id, error = %error, "Ledger write failed");
            self.emit(
                ResilienceEvent::new("ledger", "ledger.write_failed")
                    .with_level(EventLevel::Error)
                    .with_field("task_id", task.id.as_str())
                    .with_field("error", error.to_string()),
            );
            return RunOutcome::Aborted {
                task_id: Some(task.id),
                error,
            };
        }

        self.emit(
            ResilienceEvent::new("ledger", "ledger.recorded")
                .with_field("task_id", task.id.as_str())
                .with_field("success", success),
        );
        outcome
    }

    /// A stopped run writes its record only while no newer run has started
    /// and the task is not already settled.
    async fn may_record_stop(&self, run_id: Uuid, task_id: &str) -> bool {
        if !self.state.lock().is_latest(run_id) {
            return false;
        }
        !matches!(self.ledger.is_settled(task_id).await, Ok(true))
    }

    async fn select(&self) -> Result<Option<Task>> {
        let candidates = self.source.list_candidate_tasks().await.map_err(|e| match e {
            ResilienceError::TaskSource(_) => e,
            other => ResilienceError::TaskSource(other.to_string()),
        })?;

        for task in candidates {
            if self.ledger.is_settled(&task.id).await? {
                debug!(task_id = %task.id, "Skipping settled task");
                continue;
            }
            return Ok(Some(task));
        }
        Ok(None)
    }

    async fn run_stage(
        &self,
        stage: &SharedStage,
        input: &StageInput,
        token: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let config = stage
            .retry_config()
            .unwrap_or_else(|| self.default_retry.clone());
        let name = stage.name();
        let timeout = stage.timeout();
        let operation = move || async move {
            // Cancelled is not retriable, so a stopped run makes no further attempts.
            if token.is_cancelled() {
                return Err(ResilienceError::Cancelled(STOPPED_MESSAGE.to_string()));
            }
            attempt_stage(stage.as_ref(), input, timeout).await
        };

        if stage.guarded() {
            self.breakers.call(name, operation, &config).await
        } else {
            self.executor.run(name, operation, &config).await
        }
    }

    async fn compensate(&self, task: &Task, completed: &[(SharedStage, StageResult)]) {
        for (stage, result) in completed.iter().rev() {
            let undo = AssertUnwindSafe(stage.compensate(task, result))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panicked(stage.name(), &*payload)));
            match undo {
                Ok(()) => {
                    debug!(task_id = %task.id, stage = stage.name(), "Compensated");
                    self.emit(
                        ResilienceEvent::new(COMPONENT, "pipeline.compensated")
                            .with_field("task_id", task.id.as_str())
                            .with_field("stage", stage.name()),
                    );
                }
                Err(error) => {
                    warn!(task_id = %task.id, stage = stage.name(), error = %error, "Compensation failed");
                    self.emit(
                        ResilienceEvent::new(COMPONENT, "pipeline.compensation_failed")
                            .with_level(EventLevel::Warn)
                            .with_field("task_id", task.id.as_str())
                            .with_field("stage", stage.name())
                            .with_field("error", error.to_string()),
                    );
                }
            }
        }
    }
}

/// One stage attempt. A panic inside the stage becomes a permanent failure.
async fn attempt_stage(
    stage: &dyn PipelineStage,
    input: &StageInput,
    timeout: Option<Duration>,
) -> Result<serde_json::Value> {
    let call = AssertUnwindSafe(stage.execute(input))
        .catch_unwind()
        .map(|caught| caught.unwrap_or_else(|payload| Err(panicked(stage.name(), &*payload))));
    let Some(limit) = timeout else {
        return call.await;
    };
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ResilienceError::transient(
            stage.name(),
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}

fn panicked(stage: &str, payload: &(dyn Any + Send)) -> ResilienceError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ResilienceError::permanent(stage, format!("stage panicked: {message}"))
}

/// Builder for [`PipelineOrchestrator`].
pub struct PipelineOrchestratorBuilder {
    source: Arc<dyn TaskSource>,
    ledger: Arc<dyn ProcessingLedger>,
    stages: Vec<SharedStage>,
    default_retry: RetryConfig,
    circuit: CircuitBreakerConfig,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    sink: Option<SharedEventSink>,
}

impl std::fmt::Debug for PipelineOrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("PipelineOrchestratorBuilder")
            .field("stages", &stages)
            .field("default_retry", &self.default_retry)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestratorBuilder {
    fn new(source: Arc<dyn TaskSource>, ledger: Arc<dyn ProcessingLedger>) -> Self {
        Self {
            source,
            ledger,
            stages: Vec::new(),
            default_retry: RetryConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            breakers: None,
            sink: None,
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(self, stage: impl PipelineStage + 'static) -> Self {
        self.shared_stage(Arc::new(stage))
    }

    /// Appends an already shared stage.
    #[must_use]
    pub fn shared_stage(mut self, stage: SharedStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Retry policy for stages that do not declare their own.
    #[must_use]
    pub fn default_retry(mut self, config: RetryConfig) -> Self {
        self.default_retry = config;
        self
    }

    /// Breaker settings for a registry created by [`build`](Self::build).
    #[must_use]
    pub fn circuit_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit = config;
        self
    }

    /// Uses an existing breaker registry, e.g. one shared with batch jobs.
    #[must_use]
    pub fn breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    /// Where events go. Defaults to the tracing bridge.
    #[must_use]
    pub fn event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the configuration and builds the orchestrator.
    pub fn build(self) -> Result<PipelineOrchestrator> {
        if self.stages.is_empty() {
            return Err(ResilienceError::Config(
                "pipeline needs at least one stage".to_string(),
            ));
        }
        self.default_retry.validate()?;
        for stage in &self.stages {
            if let Some(config) = stage.retry_config() {
                config.validate().map_err(|e| {
                    ResilienceError::Config(format!("stage '{}': {e}", stage.name()))
                })?;
            }
        }

        let sink = self.sink.unwrap_or_else(default_sink);
        let breakers = match self.breakers {
            Some(registry) => registry,
            None => {
                self.circuit.validate()?;
                Arc::new(CircuitBreakerRegistry::new(self.circuit, sink.clone()))
            }
        };

        Ok(PipelineOrchestrator {
            inner: Arc::new(Inner {
                source: self.source,
                ledger: self.ledger,
                stages: self.stages,
                executor: RetryExecutor::new(sink.clone()),
                breakers,
                default_retry: self.default_retry,
                sink,
                state: Mutex::new(RunState::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::ledger::InMemoryLedger;
    use crate::pipeline::{FnStage, StaticTaskSource};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn no_wait() -> RetryConfig {
        RetryConfig::default().with_base_delay_ms(0).with_jitter_fraction(0.0)
    }

    fn echo(name: &'static str) -> FnStage {
        FnStage::new(name, move |input: StageInput| async move {
            let mut trail = input
                .previous
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            trail.push(serde_json::json!(name));
            Ok(serde_json::Value::Array(trail))
        })
    }

    fn build(
        tasks: Vec<Task>,
        ledger: Arc<InMemoryLedger>,
        stages: Vec<FnStage>,
    ) -> (PipelineOrchestrator, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let mut builder = PipelineOrchestrator::builder(Arc::new(StaticTaskSource::new(tasks)), ledger)
            .default_retry(no_wait())
            .event_sink(sink.clone());
        for stage in stages {
            builder = builder.stage(stage);
        }
        (builder.build().unwrap(), sink)
    }

    #[tokio::test]
    async fn test_success_passes_outputs_along() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (orchestrator, sink) = build(
            vec![Task::new("T1", "clip")],
            ledger.clone(),
            vec![echo("download"), echo("transcode"), echo("publish")],
        );

        let outcome = orchestrator.run_now().await.unwrap();
        let RunOutcome::Succeeded { task_id, results } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(task_id, "T1");
        assert_eq!(
            results[2].data,
            serde_json::json!(["download", "transcode", "publish"])
        );

        let record = ledger.get("T1").await.unwrap().unwrap();
        assert!(record.success);
        assert_eq!(record.metadata["task_name"], "clip");
        assert_eq!(sink.count("ledger.recorded"), 1);
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_no_candidate_when_all_succeeded() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .record("T1", LedgerRecord::succeeded("T1", serde_json::Map::new()))
            .await
            .unwrap();
        let (orchestrator, _) = build(vec![Task::new("T1", "clip")], ledger.clone(), vec![echo("a")]);

        let outcome = orchestrator.run_now().await.unwrap();
        assert!(matches!(outcome, RunOutcome::NoCandidate));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_permanently_failed_task_is_skipped() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (orchestrator, _) = build(
            vec![Task::new("T1", "bad"), Task::new("T2", "good")],
            ledger.clone(),
            vec![echo("a")],
        );

        orchestrator
            .mark_permanently_failed("T1", "unsupported codec")
            .await
            .unwrap();
        let outcome = orchestrator.run_now().await.unwrap();
        assert_eq!(outcome.task_id(), Some("T2"));
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let compensating = |name: &'static str| {
            let order = order.clone();
            echo(name).with_compensation(move |_, _| {
                let order = order.clone();
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            })
        };
        let failing = FnStage::new("publish", |_| async {
            Err(ResilienceError::permanent("publish", "rejected"))
        });

        let ledger = Arc::new(InMemoryLedger::new());
        let (orchestrator, _) = build(
            vec![Task::new("T1", "clip")],
            ledger.clone(),
            vec![compensating("download"), compensating("transcode"), failing],
        );

        let outcome = orchestrator.run_now().await.unwrap();
        let RunOutcome::Failed { stage_index, stage, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!((stage_index, stage.as_str()), (2, "publish"));
        assert_eq!(*order.lock(), vec!["transcode", "download"]);

        let record = ledger.get("T1").await.unwrap().unwrap();
        assert!(!record.success);
        assert!(record.error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_compensation_failure_still_records() {
        let broken_undo = echo("download")
            .with_compensation(|_, _| async { Err(ResilienceError::Io("disk gone".to_string())) });
        let failing = FnStage::new("upload", |_| async {
            Err(ResilienceError::permanent("upload", "bad title"))
        });

        let ledger = Arc::new(InMemoryLedger::new());
        let (orchestrator, sink) = build(vec![Task::new("T1", "clip")], ledger.clone(), vec![broken_undo, failing]);

        let outcome = orchestrator.run_now().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(sink.count("pipeline.compensation_failed"), 1);
        assert!(ledger.get("T1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_stage_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky = FnStage::new("transcode", move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ResilienceError::transient("transcode", "busy"))
                } else {
                    Ok(serde_json::json!("ok"))
                }
            }
        });

        let ledger = Arc::new(InMemoryLedger::new());
        let (orchestrator, _) = build(vec![Task::new("T1", "clip")], ledger, vec![flaky]);

        assert!(orchestrator.run_now().await.unwrap().is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_is_transient() {
        let slow = FnStage::new("caption", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(serde_json::json!("late"))
        })
        .with_timeout(Duration::from_millis(100))
        .with_retry_config(RetryConfig::single_attempt());

        let ledger = Arc::new(InMemoryLedger::new());
        let (orchestrator, _) = build(vec![Task::new("T1", "clip")], ledger, vec![slow]);

        let outcome = orchestrator.run_now().await.unwrap();
        let RunOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.root_cause().is_retriable());
    }

    #[tokio::test]
    async fn test_source_failure_aborts_without_record() {
        struct BrokenSource;

        #[async_trait::async_trait]
        impl TaskSource for BrokenSource {
            async fn list_candidate_tasks(&self) -> Result<Vec<Task>> {
                Err(ResilienceError::Io("feed unreachable".to_string()))
            }
        }

        let ledger = Arc::new(InMemoryLedger::new());
        let orchestrator = PipelineOrchestrator::builder(Arc::new(BrokenSource), ledger.clone())
            .stage(echo("a"))
            .event_sink(Arc::new(CollectingEventSink::new()))
            .build()
            .unwrap();

        let outcome = orchestrator.run_now().await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Aborted {
                task_id: None,
                error: ResilienceError::TaskSource(_)
            }
        ));
        assert!(ledger.is_empty());
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_permanently() {
        let crashing = FnStage::new("transcode", |_| async {
            let frames: Option<serde_json::Value> = None;
            Ok(frames.expect("codec crashed"))
        });
        let ledger = Arc::new(InMemoryLedger::new());
        let (orchestrator, _) = build(vec![Task::new("T1", "clip")], ledger.clone(), vec![crashing]);

        let outcome = orchestrator.run_now().await.unwrap();
        let RunOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(matches!(error, ResilienceError::PermanentValidation { .. }));
        assert!(error.to_string().contains("codec crashed"));
        assert!(!ledger.get("T1").await.unwrap().unwrap().success);
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_releases_lock() {
        let slow = FnStage::new("upload", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::json!("done"))
        });
        let (orchestrator, sink) = build(vec![Task::new("T1", "clip")], Arc::new(InMemoryLedger::new()), vec![slow]);

        let abandoned = tokio::time::timeout(Duration::from_secs(1), orchestrator.run_now()).await;
        assert!(abandoned.is_err());
        assert!(!orchestrator.is_busy());
        assert_eq!(orchestrator.status().phase, PipelinePhase::Idle);
        assert_eq!(sink.count("pipeline.run_abandoned"), 1);
        assert!(orchestrator.run_once().is_accepted());
    }

    #[test]
    fn test_build_rejects_empty_pipeline() {
        let err = PipelineOrchestrator::builder(
            Arc::new(StaticTaskSource::default()),
            Arc::new(InMemoryLedger::new()),
        )
        .build()
        .unwrap_err();
        assert!(matches!(err, ResilienceError::Config(_)));
    }

    #[test]
    fn test_stop_when_idle_returns_false() {
        let (orchestrator, _) = build(Vec::new(), Arc::new(InMemoryLedger::new()), vec![echo("a")]);
        assert!(!orchestrator.stop());
        assert_eq!(orchestrator.status().phase, PipelinePhase::Idle);
    }
}
