//! Per-operation circuit breaker registry.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::{ResilienceError, Result};
use crate::events::{default_sink, EventLevel, ResilienceEvent, SharedEventSink};
use crate::retry::{RetryConfig, RetryExecutor};

const COMPONENT: &str = "circuit";

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Retriable failures needed to open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls, in milliseconds.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Reset timeout as a [`Duration`].
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Checks the range invariants.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::Config(
                "circuit failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whether calls are currently let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass; failures are being counted.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
}

/// Point-in-time copy of one breaker entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Retriable failures seen since the entry was created.
    pub failure_count: u32,
    /// When the circuit opened.
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct CircuitEntry {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl CircuitEntry {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }

    fn cooled_down(&self, now: Instant, timeout: Duration) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= timeout)
    }
}

/// Returns true if `err` should count toward a breaker threshold.
///
/// Looks through retry and stage wrappers, so an exhausted retry of a
/// transient failure counts while a validation failure never does.
#[must_use]
pub fn counts_toward_breaker(err: &ResilienceError) -> bool {
    err.root_cause().is_retriable()
}

/// Failure-tracking state for every guarded operation, keyed by name.
///
/// Each key has its own lock, so breakers for independent operations never
/// contend. An entry exists only between the first failure and the next
/// reset; a missing entry means closed with zero failures.
pub struct CircuitBreakerRegistry {
    entries: DashMap<String, CircuitEntry>,
    config: CircuitBreakerConfig,
    executor: RetryExecutor,
    sink: SharedEventSink,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), default_sink())
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("tracked", &self.entries.len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, sink: SharedEventSink) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            executor: RetryExecutor::new(sink.clone()),
            sink,
        }
    }

    /// The registry configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns true while `name` is open and its timeout has not elapsed.
    ///
    /// An open entry whose timeout has elapsed is removed (full reset, no
    /// half-open probing) and `false` is returned.
    pub fn is_open(&self, name: &str) -> bool {
        let now = Instant::now();
        let timeout = self.config.reset_timeout();

        {
            let Some(entry) = self.entries.get(name) else {
                return false;
            };
            if entry.state != CircuitState::Open {
                return false;
            }
            if !entry.cooled_down(now, timeout) {
                return true;
            }
        }

        let removed = self.entries.remove_if(name, |_, entry| {
            entry.state == CircuitState::Open && entry.cooled_down(now, timeout)
        });
        if removed.is_some() {
            info!(operation = name, "Circuit reset after timeout");
            self.sink.emit(
                ResilienceEvent::new(COMPONENT, "circuit.reset")
                    .with_field("operation", name)
                    .with_field("reason", "timeout"),
            );
        }
        false
    }

    /// Counts a failure for `name`, opening the circuit at `threshold`.
    pub fn record_failure(&self, name: &str, threshold: u32) {
        let opened_with = {
            let mut entry = self
                .entries
                .entry(name.to_string())
                .or_insert_with(CircuitEntry::closed);
            entry.failure_count = entry.failure_count.saturating_add(1);

            if entry.state == CircuitState::Closed && entry.failure_count >= threshold {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                Some(entry.failure_count)
            } else {
                None
            }
        };

        if let Some(failures) = opened_with {
            warn!(operation = name, failures, "Circuit opened");
            self.sink.emit(
                ResilienceEvent::new(COMPONENT, "circuit.opened")
                    .with_level(EventLevel::Warn)
                    .with_field("operation", name)
                    .with_field("failure_count", failures)
                    .with_field("reset_timeout_ms", self.config.reset_timeout_ms),
            );
        }
    }

    /// Forgets everything about `name`.
    pub fn record_success(&self, name: &str) {
        if self.entries.remove(name).is_some() {
            self.sink.emit(
                ResilienceEvent::new(COMPONENT, "circuit.reset")
                    .with_field("operation", name)
                    .with_field("reason", "success"),
            );
        }
    }

    /// Copies the entry for `name`, if any.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<CircuitSnapshot> {
        self.entries.get(name).map(|entry| CircuitSnapshot {
            state: entry.state,
            failure_count: entry.failure_count,
            opened_at: entry.opened_at,
        })
    }

    /// Names of all entries currently in the open state.
    #[must_use]
    pub fn open_circuits(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.state == CircuitState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Runs `operation` through the retry executor unless the circuit is open.
    ///
    /// Success clears the entry. A failure is recorded only when
    /// `is_retriable` accepts it.
    pub async fn call_guarded<T, F, Fut, P>(
        &self,
        name: &str,
        operation: F,
        config: &RetryConfig,
        is_retriable: P,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&ResilienceError) -> bool,
    {
        if self.is_open(name) {
            self.sink.emit(
                ResilienceEvent::new(COMPONENT, "circuit.rejected")
                    .with_level(EventLevel::Warn)
                    .with_field("operation", name),
            );
            return Err(ResilienceError::circuit_open(name));
        }

        match self.executor.run(name, operation, config).await {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(err) => {
                if is_retriable(&err) {
                    self.record_failure(name, self.config.failure_threshold);
                }
                Err(err)
            }
        }
    }

    /// [`call_guarded`](Self::call_guarded) with [`counts_toward_breaker`].
    pub async fn call<T, F, Fut>(&self, name: &str, operation: F, config: &RetryConfig) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_guarded(name, operation, config, counts_toward_breaker)
            .await
    }
}
