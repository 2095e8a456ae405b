//! Retry loop around a fallible async operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::RetryConfig;
use crate::errors::{ResilienceError, Result};
use crate::events::{default_sink, EventLevel, ResilienceEvent, SharedEventSink};

const COMPONENT: &str = "retry";

/// Attempt statistics for one `run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    /// Number of times the operation was invoked.
    pub attempts: u32,
    /// Wall time including backoff sleeps.
    pub elapsed: Duration,
}

/// Runs operations up to `max_attempts` times with exponential backoff.
///
/// Only retriable errors (see [`ResilienceError::is_retriable`]) consume
/// further attempts. Anything else ends the loop at once and is returned
/// as-is, so permanent failures are never retried and never wrapped.
#[derive(Clone)]
pub struct RetryExecutor {
    sink: SharedEventSink,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(default_sink())
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor").finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Creates an executor reporting to `sink`.
    #[must_use]
    pub fn new(sink: SharedEventSink) -> Self {
        Self { sink }
    }

    /// The sink this executor reports to.
    #[must_use]
    pub fn sink(&self) -> &SharedEventSink {
        &self.sink
    }

    /// Runs `operation`, retrying transient failures.
    pub async fn run<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
        config: &RetryConfig,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_with_report(operation_name, operation, config)
            .await
            .map(|(value, _)| value)
    }

    /// Runs `operation` and also reports how many attempts it took.
    pub async fn run_with_report<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
        config: &RetryConfig,
    ) -> Result<(T, RetryReport)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        config.validate()?;
        let backoff = config.backoff();
        let started = Instant::now();

        for attempt in 1..=config.max_attempts {
            let attempt_started = Instant::now();
            let outcome = operation().await;
            let duration_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    self.emit_attempt(operation_name, attempt, config, duration_ms, None);
                    let report = RetryReport {
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                    return Ok((value, report));
                }
                Err(err) => {
                    self.emit_attempt(operation_name, attempt, config, duration_ms, Some(&err));

                    if !err.is_retriable() {
                        debug!(
                            operation = operation_name,
                            attempt,
                            error = %err,
                            "Not retrying non-retriable error"
                        );
                        return Err(err);
                    }

                    if attempt == config.max_attempts {
                        self.sink.emit(
                            ResilienceEvent::new(COMPONENT, "retry.exhausted")
                                .with_level(EventLevel::Error)
                                .with_field("operation", operation_name)
                                .with_field("max_attempts", config.max_attempts)
                                .with_field("error", err.to_string()),
                        );
                        return Err(ResilienceError::retries_exhausted(
                            operation_name,
                            config.max_attempts,
                            err,
                        ));
                    }

                    let delay = backoff.delay(attempt - 1);
                    debug!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // validate() guarantees at least one attempt, and the last attempt
        // always returns from inside the loop.
        Err(ResilienceError::Config(format!(
            "'{operation_name}' was configured with zero attempts"
        )))
    }

    fn emit_attempt(
        &self,
        operation_name: &str,
        attempt: u32,
        config: &RetryConfig,
        duration_ms: u64,
        error: Option<&ResilienceError>,
    ) {
        let mut event = ResilienceEvent::new(COMPONENT, "retry.attempt")
            .with_level(EventLevel::Debug)
            .with_field("operation", operation_name)
            .with_field("attempt", attempt)
            .with_field("max_attempts", config.max_attempts)
            .with_field("duration_ms", duration_ms);

        event = match error {
            None => event.with_field("outcome", "success"),
            Some(err) => event
                .with_level(EventLevel::Warn)
                .with_field("outcome", "failure")
                .with_field("error", err.to_string())
                .with_field("retriable", err.is_retriable()),
        };

        self.sink.emit(event);
    }
}

/// Runs `operation` with a default executor that logs through `tracing`.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::default()
        .run(operation_name, operation, config)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
            .with_jitter_fraction(0.0)
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_config(3), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::default();

        let (value, report) = executor
            .run_with_report(
                "op",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(ResilienceError::transient("op", format!("attempt {n}")))
                        } else {
                            Ok("done")
                        }
                    }
                },
                &fast_config(5),
            )
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_always_failing_invoked_exactly_max_attempts() {
        for max_attempts in [1_u32, 2, 4, 6] {
            let calls = AtomicU32::new(0);
            let result: Result<()> = with_retry(&fast_config(max_attempts), "flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(ResilienceError::transient("flaky", format!("failure {n}"))) }
            })
            .await;

            assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
            match result {
                Err(ResilienceError::RetriesExhausted { operation, attempts, source }) => {
                    assert_eq!(operation, "flaky");
                    assert_eq!(attempts, max_attempts);
                    assert!(source.to_string().contains(&format!("failure {max_attempts}")));
                }
                other => panic!("expected RetriesExhausted, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_config(5), "validate", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ResilienceError::permanent("validate", "malformed id")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ResilienceError::PermanentValidation { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_invoking() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_config(0), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(matches!(result, Err(ResilienceError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_emits_event_per_attempt() {
        let sink = Arc::new(CollectingEventSink::new());
        let executor = RetryExecutor::new(sink.clone());

        let _: Result<()> = executor
            .run(
                "upload",
                || async { Err(ResilienceError::transient("upload", "503")) },
                &fast_config(3),
            )
            .await;

        let attempts = sink.events_of_type("retry.attempt");
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].field("attempt"), Some(&serde_json::json!(3)));
        assert_eq!(attempts[0].field("outcome"), Some(&serde_json::json!("failure")));
        assert_eq!(sink.count("retry.exhausted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(100)
            .with_jitter_fraction(0.0);

        let started = Instant::now();
        let _: Result<()> = with_retry(&config, "op", || async {
            Err(ResilienceError::transient("op", "down"))
        })
        .await;

        // 100ms after attempt 1, 200ms after attempt 2, none after the last.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(310), "{elapsed:?}");
    }
}
