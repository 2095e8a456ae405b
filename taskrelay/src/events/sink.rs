//! Event sink trait and implementations.

use super::{EventLevel, ResilienceEvent};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

/// Receiver of [`ResilienceEvent`]s.
///
/// Emission happens on the hot path of retries and stage transitions, so
/// implementations must not block and must never panic.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: ResilienceEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: ResilienceEvent) {}
}

/// A sink that forwards events to `tracing` at the event's own level.
///
/// Events below `min_level` are dropped.
#[derive(Debug, Clone, Copy)]
pub struct LoggingEventSink {
    min_level: EventLevel,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self {
            min_level: EventLevel::Debug,
        }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink that drops events below `min_level`.
    #[must_use]
    pub fn new(min_level: EventLevel) -> Self {
        Self { min_level }
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event: ResilienceEvent) {
        if event.level < self.min_level {
            return;
        }

        let fields = serde_json::Value::Object(event.fields);
        let component = event.component.as_str();
        let message = event.message.as_str();

        match event.level {
            EventLevel::Debug => debug!(component, fields = %fields, "{message}"),
            EventLevel::Info => info!(component, fields = %fields, "{message}"),
            EventLevel::Warn => warn!(component, fields = %fields, "{message}"),
            EventLevel::Error => error!(component, fields = %fields, "{message}"),
        }
    }
}

/// A sink that keeps every event in memory, for tests and status pages.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<ResilienceEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose message starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<ResilienceEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.message.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Counts events whose message is exactly `message`.
    #[must_use]
    pub fn count(&self, message: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.message == message)
            .count()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: ResilienceEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink() {
        NoOpEventSink.emit(ResilienceEvent::new("test", "test.event"));
    }

    #[test]
    fn test_logging_sink_filters_below_min_level() {
        let sink = LoggingEventSink::new(EventLevel::Warn);
        sink.emit(ResilienceEvent::new("test", "dropped").with_level(EventLevel::Debug));
        sink.emit(ResilienceEvent::new("test", "kept").with_level(EventLevel::Error));
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(ResilienceEvent::new("retry", "retry.attempt"));
        sink.emit(ResilienceEvent::new("retry", "retry.attempt"));
        sink.emit(ResilienceEvent::new("circuit", "circuit.opened"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count("retry.attempt"), 2);
        assert_eq!(sink.events_of_type("circuit.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
