//! Test fixtures: flaky operations and a ready-made pipeline harness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::circuit::CircuitBreakerConfig;
use crate::errors::{ResilienceError, Result};
use crate::events::CollectingEventSink;
use crate::ledger::InMemoryLedger;
use crate::pipeline::{PipelineOrchestrator, PipelineStage, StaticTaskSource, Task};
use crate::retry::RetryConfig;

/// An operation that fails a fixed number of times before succeeding.
///
/// Clones share the call counter.
#[derive(Debug, Clone)]
pub struct FlakyOperation {
    name: String,
    failures: usize,
    permanent: bool,
    calls: Arc<AtomicUsize>,
}

impl FlakyOperation {
    /// Fails transiently `failures` times, then succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            permanent: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never succeeds; every failure is transient.
    #[must_use]
    pub fn always_failing(name: impl Into<String>) -> Self {
        Self::new(name, usize::MAX)
    }

    /// Failures are permanent instead of transient.
    #[must_use]
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Performs one call. Succeeds with the 1-based call number.
    pub async fn call(&self) -> Result<usize> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            let message = format!("failure on call {call}");
            return Err(if self.permanent {
                ResilienceError::permanent(self.name.clone(), message)
            } else {
                ResilienceError::transient(self.name.clone(), message)
            });
        }
        Ok(call)
    }
}

/// `count` tasks with ids `T1..=Tn`.
#[must_use]
pub fn tasks(count: usize) -> Vec<Task> {
    (1..=count)
        .map(|n| Task::new(format!("T{n}"), format!("task {n}")))
        .collect()
}

/// Retry policy with no waiting between attempts.
#[must_use]
pub fn immediate_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::default()
        .with_max_attempts(max_attempts)
        .with_base_delay_ms(0)
        .with_jitter_fraction(0.0)
}

/// An orchestrator wired to in-memory collaborators that tests can inspect.
#[derive(Debug)]
pub struct TestPipeline {
    /// The orchestrator under test.
    pub orchestrator: PipelineOrchestrator,
    /// Candidate list.
    pub source: Arc<StaticTaskSource>,
    /// Ledger.
    pub ledger: Arc<InMemoryLedger>,
    /// Every emitted event.
    pub events: Arc<CollectingEventSink>,
}

/// Builder for [`TestPipeline`].
pub struct TestPipelineBuilder {
    tasks: Vec<Task>,
    stages: Vec<Arc<dyn PipelineStage>>,
    retry: RetryConfig,
    circuit: CircuitBreakerConfig,
    ledger: Arc<InMemoryLedger>,
}

impl std::fmt::Debug for TestPipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPipelineBuilder")
            .field("tasks", &self.tasks.len())
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

impl TestPipeline {
    /// Starts a harness with no waiting between retries.
    #[must_use]
    pub fn builder() -> TestPipelineBuilder {
        TestPipelineBuilder {
            tasks: Vec::new(),
            stages: Vec::new(),
            retry: immediate_retry(3),
            circuit: CircuitBreakerConfig::default(),
            ledger: Arc::new(InMemoryLedger::new()),
        }
    }
}

impl TestPipelineBuilder {
    /// Candidate tasks, in order.
    #[must_use]
    pub fn tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Appends a stage; keep the `Arc` to inspect it afterwards.
    #[must_use]
    pub fn stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Default retry policy.
    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Breaker settings.
    #[must_use]
    pub fn circuit(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit = config;
        self
    }

    /// Uses a pre-populated ledger.
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<InMemoryLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Builds the harness.
    pub fn build(self) -> Result<TestPipeline> {
        let source = Arc::new(StaticTaskSource::new(self.tasks));
        let events = Arc::new(CollectingEventSink::new());

        let mut builder = PipelineOrchestrator::builder(source.clone(), self.ledger.clone())
            .default_retry(self.retry)
            .circuit_config(self.circuit)
            .event_sink(events.clone());
        for stage in self.stages {
            builder = builder.shared_stage(stage);
        }

        Ok(TestPipeline {
            orchestrator: builder.build()?,
            source,
            ledger: self.ledger,
            events,
        })
    }
}
