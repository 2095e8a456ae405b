//! Batch execution of retry-wrapped operations.
//!
//! Items run either one after another or in chunks of at most
//! `max_concurrency`. Every item gets its own retry policy, and partial
//! results are always returned: a failing item never hides the others.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, info};

use crate::errors::{ResilienceError, Result};
use crate::events::{default_sink, EventLevel, ResilienceEvent, SharedEventSink};
use crate::retry::{RetryConfig, RetryExecutor};

const COMPONENT: &str = "batch";

type BoxedOperation<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<T>> + Send>;

/// How a batch is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Run chunks concurrently instead of one item at a time.
    #[serde(default)]
    pub parallel: bool,
    /// Stop scheduling new items after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Chunk size in parallel mode. `usize::MAX` puts everything in one chunk.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    3
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            fail_fast: false,
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl BatchOptions {
    /// Sequential, continue on failure.
    #[must_use]
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Parallel with the given chunk size.
    #[must_use]
    pub fn parallel(max_concurrency: usize) -> Self {
        Self {
            parallel: true,
            max_concurrency,
            ..Self::default()
        }
    }

    /// Enables fail-fast.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Checks the range invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ResilienceError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One operation in a batch.
pub struct BatchItem<T> {
    name: String,
    operation: BoxedOperation<T>,
    retry_config: Option<RetryConfig>,
    original_index: usize,
}

impl<T> std::fmt::Debug for BatchItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchItem")
            .field("name", &self.name)
            .field("retry_config", &self.retry_config)
            .field("original_index", &self.original_index)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> BatchItem<T> {
    /// Wraps an async closure. The closure is called once per attempt.
    pub fn new<F, Fut>(name: impl Into<String>, mut operation: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            operation: Box::new(move || Box::pin(operation())),
            retry_config: None,
            original_index: 0,
        }
    }

    /// Overrides the batch-wide retry policy for this item.
    #[must_use]
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }
}

impl<T> BatchItem<T> {
    /// The item name, used as the retry operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the submitted list. Assigned by [`BatchExecutor::run_batch`].
    #[must_use]
    pub fn original_index(&self) -> usize {
        self.original_index
    }
}

/// Result of one item.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Position in the submitted list.
    pub index: usize,
    /// Item name.
    pub name: String,
    /// What the item produced.
    pub result: Result<T>,
}

impl<T> BatchOutcome<T> {
    /// Returns true if the item succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// A successful item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSuccess<T> {
    /// Position in the submitted list.
    pub index: usize,
    /// Item name.
    pub name: String,
    /// Produced value.
    pub value: T,
}

/// A failed item.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// Position in the submitted list.
    pub index: usize,
    /// Item name.
    pub name: String,
    /// Final error after retries.
    pub error: ResilienceError,
}

/// Aggregate of a batch run.
///
/// `success_count + error_count == total_count` always holds; items that were
/// never started because of fail-fast are reported in `skipped_count` only.
/// In parallel mode `results` and `errors` are in completion order; use
/// [`sorted`](Self::sorted) for submission order.
#[derive(Debug)]
pub struct BatchSummary<T> {
    /// Successful items.
    pub results: Vec<BatchSuccess<T>>,
    /// Failed items.
    pub errors: Vec<BatchFailure>,
    /// Number of successes.
    pub success_count: usize,
    /// Number of failures.
    pub error_count: usize,
    /// Number of items that ran.
    pub total_count: usize,
    /// Number of items not started because of fail-fast.
    pub skipped_count: usize,
}

impl<T> Default for BatchSummary<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
            success_count: 0,
            error_count: 0,
            total_count: 0,
            skipped_count: 0,
        }
    }
}

impl<T> BatchSummary<T> {
    fn push(&mut self, outcome: BatchOutcome<T>) {
        self.total_count += 1;
        match outcome.result {
            Ok(value) => {
                self.success_count += 1;
                self.results.push(BatchSuccess {
                    index: outcome.index,
                    name: outcome.name,
                    value,
                });
            }
            Err(error) => {
                self.error_count += 1;
                self.errors.push(BatchFailure {
                    index: outcome.index,
                    name: outcome.name,
                    error,
                });
            }
        }
    }

    /// Returns true if every item that ran succeeded and none were skipped.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.error_count == 0 && self.skipped_count == 0
    }

    /// Re-sorts both arrays by submission index.
    #[must_use]
    pub fn sorted(mut self) -> Self {
        self.results.sort_by_key(|r| r.index);
        self.errors.sort_by_key(|e| e.index);
        self
    }
}

/// Runs collections of operations through a shared [`RetryExecutor`].
#[derive(Clone)]
pub struct BatchExecutor {
    executor: RetryExecutor,
    default_retry: RetryConfig,
    sink: SharedEventSink,
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("default_retry", &self.default_retry)
            .finish_non_exhaustive()
    }
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default(), default_sink())
    }
}

impl BatchExecutor {
    /// Creates a batch executor whose items fall back to `default_retry`.
    #[must_use]
    pub fn new(default_retry: RetryConfig, sink: SharedEventSink) -> Self {
        Self {
            executor: RetryExecutor::new(sink.clone()),
            default_retry,
            sink,
        }
    }

    /// Runs every item according to `options`.
    pub async fn run_batch<T>(
        &self,
        items: Vec<BatchItem<T>>,
        options: &BatchOptions,
    ) -> Result<BatchSummary<T>> {
        options.validate()?;

        let items: Vec<BatchItem<T>> = items
            .into_iter()
            .enumerate()
            .map(|(index, mut item)| {
                item.original_index = index;
                item
            })
            .collect();
        let submitted = items.len();

        let summary = if options.parallel {
            self.run_parallel(items, options).await
        } else {
            self.run_sequential(items, options).await
        };

        info!(
            submitted,
            succeeded = summary.success_count,
            failed = summary.error_count,
            skipped = summary.skipped_count,
            "Batch finished"
        );
        let level = if summary.error_count > 0 {
            EventLevel::Warn
        } else {
            EventLevel::Info
        };
        self.sink.emit(
            ResilienceEvent::new(COMPONENT, "batch.completed")
                .with_level(level)
                .with_field("parallel", options.parallel)
                .with_field("success_count", summary.success_count)
                .with_field("error_count", summary.error_count)
                .with_field("total_count", summary.total_count)
                .with_field("skipped_count", summary.skipped_count),
        );

        Ok(summary)
    }

    async fn run_sequential<T>(
        &self,
        items: Vec<BatchItem<T>>,
        options: &BatchOptions,
    ) -> BatchSummary<T> {
        let mut summary = BatchSummary::default();
        let mut pending = items.into_iter();

        for item in pending.by_ref() {
            let outcome = self.run_item(item).await;
            let failed = !outcome.is_success();
            summary.push(outcome);

            if failed && options.fail_fast {
                debug!("Fail-fast: stopping sequential batch");
                break;
            }
        }

        summary.skipped_count = pending.count();
        summary
    }

    async fn run_parallel<T>(
        &self,
        items: Vec<BatchItem<T>>,
        options: &BatchOptions,
    ) -> BatchSummary<T> {
        let mut summary = BatchSummary::default();
        let mut pending = items.into_iter().peekable();

        while pending.peek().is_some() {
            let mut in_flight: FuturesUnordered<_> = pending
                .by_ref()
                .take(options.max_concurrency)
                .map(|item| self.run_item(item))
                .collect();

            let mut chunk_failed = false;
            // The whole chunk settles before the next one starts.
            while let Some(outcome) = in_flight.next().await {
                chunk_failed |= !outcome.is_success();
                summary.push(outcome);
            }

            if chunk_failed && options.fail_fast {
                debug!("Fail-fast: not starting remaining chunks");
                break;
            }
        }

        summary.skipped_count = pending.count();
        summary
    }

    async fn run_item<T>(&self, item: BatchItem<T>) -> BatchOutcome<T> {
        let BatchItem {
            name,
            mut operation,
            retry_config,
            original_index,
        } = item;
        let config = retry_config.unwrap_or_else(|| self.default_retry.clone());

        let result = self.executor.run(&name, || operation(), &config).await;

        BatchOutcome {
            index: original_index,
            name,
            result,
        }
    }
}
