//! Error types for taskrelay.
//!
//! The taxonomy separates failures that are worth retrying (a dependency
//! hiccup) from failures that never will succeed (bad input), and adds the
//! wrapper errors produced by the retry executor, the circuit breaker and the
//! pipeline orchestrator.

use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ResilienceError> = std::result::Result<T, E>;

/// The main error type for taskrelay operations.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// A dependency failed in a way that may succeed on a later attempt.
    #[error("Transient failure in '{operation}': {message}")]
    TransientDependency {
        /// Operation that failed.
        operation: String,
        /// Failure description.
        message: String,
    },

    /// The request itself is invalid; retrying cannot help.
    #[error("Validation failed in '{operation}': {message}")]
    PermanentValidation {
        /// Operation that failed.
        operation: String,
        /// Failure description.
        message: String,
    },

    /// The breaker for this operation is open and the call was not attempted.
    #[error("Circuit open for '{operation}'")]
    CircuitOpen {
        /// Operation whose breaker is open.
        operation: String,
    },

    /// Every attempt failed.
    #[error("'{operation}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Operation that was retried.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last underlying failure.
        source: Box<ResilienceError>,
    },

    /// A pipeline stage failed terminally.
    #[error("Stage {index} ('{stage}') failed: {source}")]
    PipelineStage {
        /// Zero-based position of the stage.
        index: usize,
        /// Stage name.
        stage: String,
        /// What went wrong.
        source: Box<ResilienceError>,
    },

    /// A pipeline run is already in flight.
    #[error("Pipeline is busy")]
    Busy,

    /// The run was stopped on request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The processing ledger could not be read or written.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// The task source could not list candidates.
    #[error("Task source error: {0}")]
    TaskSource(String),

    /// Configuration is out of range or unreadable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl ResilienceError {
    /// Creates a transient dependency error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a permanent validation error.
    #[must_use]
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermanentValidation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a circuit-open error.
    #[must_use]
    pub fn circuit_open(operation: impl Into<String>) -> Self {
        Self::CircuitOpen {
            operation: operation.into(),
        }
    }

    /// Wraps the last failure of an exhausted retry loop.
    #[must_use]
    pub fn retries_exhausted(operation: impl Into<String>, attempts: u32, last: Self) -> Self {
        Self::RetriesExhausted {
            operation: operation.into(),
            attempts,
            source: Box::new(last),
        }
    }

    /// Tags a failure with the pipeline stage it came from.
    #[must_use]
    pub fn stage(index: usize, stage: impl Into<String>, source: Self) -> Self {
        Self::PipelineStage {
            index,
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// Returns true if another attempt could succeed.
    ///
    /// Only transient dependency failures qualify. Wrapper errors are never
    /// retriable themselves: they already represent a finished decision.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientDependency { .. })
    }

    /// Follows `RetriesExhausted` and `PipelineStage` wrappers to the
    /// underlying failure.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RetriesExhausted { source, .. } | Self::PipelineStage { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Short machine-readable name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientDependency { .. } => "TransientDependencyError",
            Self::PermanentValidation { .. } => "PermanentValidationError",
            Self::CircuitOpen { .. } => "CircuitOpenError",
            Self::RetriesExhausted { .. } => "RetriesExhaustedError",
            Self::PipelineStage { .. } => "PipelineStageError",
            Self::Busy => "BusyError",
            Self::Cancelled(_) => "CancelledError",
            Self::Ledger(_) => "LedgerError",
            Self::TaskSource(_) => "TaskSourceError",
            Self::Config(_) => "ConfigError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        }
    }

    /// Converts to a dictionary representation for events and ledger metadata.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), json!(self.kind()));
        map.insert("message".to_string(), json!(self.to_string()));

        match self {
            Self::RetriesExhausted { operation, attempts, .. } => {
                map.insert("operation".to_string(), json!(operation));
                map.insert("attempts".to_string(), json!(attempts));
            }
            Self::PipelineStage { index, stage, .. } => {
                map.insert("stage_index".to_string(), json!(index));
                map.insert("stage".to_string(), json!(stage));
            }
            Self::TransientDependency { operation, .. }
            | Self::PermanentValidation { operation, .. }
            | Self::CircuitOpen { operation } => {
                map.insert("operation".to_string(), json!(operation));
            }
            _ => {}
        }

        if !std::ptr::eq(self.root_cause(), self) {
            map.insert("root_cause".to_string(), json!(self.root_cause().kind()));
        }

        map
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
