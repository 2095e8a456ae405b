//! Structured event emission for observability.
//!
//! Every retry attempt, breaker transition, stage transition and ledger write
//! produces a [`ResilienceEvent`] that is handed to an [`EventSink`]. Sinks
//! are injected into the components that emit; there is no global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Severity of an event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    /// Fine-grained detail, e.g. a single retry attempt.
    Debug,
    /// Normal progress.
    #[default]
    Info,
    /// Something degraded but handled.
    Warn,
    /// A terminal failure.
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A single observability event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceEvent {
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Emitting component, e.g. `retry` or `pipeline`.
    pub component: String,
    /// Severity.
    pub level: EventLevel,
    /// Dotted event name, e.g. `retry.attempt`.
    pub message: String,
    /// Structured payload.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ResilienceEvent {
    /// Creates an info-level event with no fields.
    #[must_use]
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            level: EventLevel::Info,
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Sets the level.
    #[must_use]
    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a field by name.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}

/// Shared handle to a sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Returns the sink used when none is configured: events go to `tracing`.
#[must_use]
pub fn default_sink() -> SharedEventSink {
    Arc::new(LoggingEventSink::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = ResilienceEvent::new("retry", "retry.attempt")
            .with_level(EventLevel::Debug)
            .with_field("attempt", 2)
            .with_field("operation", "download");

        assert_eq!(event.component, "retry");
        assert_eq!(event.level, EventLevel::Debug);
        assert_eq!(event.field("attempt"), Some(&serde_json::json!(2)));
        assert_eq!(event.field("operation"), Some(&serde_json::json!("download")));
    }

    #[test]
    fn test_event_serializes_level_snake_case() {
        let event = ResilienceEvent::new("ledger", "ledger.recorded").with_level(EventLevel::Warn);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["level"], "warn");
        assert_eq!(json["message"], "ledger.recorded");
    }
}
