//! Units of work and where they come from.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// One unit of work, e.g. a video reference.
///
/// Immutable once handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable unique identifier; the ledger key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Arbitrary source-specific data.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Creates a task without metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Supplies candidate tasks, in priority order.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Lists the current candidates. Must not have side effects.
    async fn list_candidate_tasks(&self) -> Result<Vec<Task>>;
}

/// A task source backed by a fixed, replaceable list.
#[derive(Debug, Default)]
pub struct StaticTaskSource {
    tasks: RwLock<Vec<Task>>,
}

impl StaticTaskSource {
    /// Creates a source listing `tasks` in order.
    #[must_use]
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
        }
    }

    /// Appends a task.
    pub fn push(&self, task: Task) {
        self.tasks.write().push(task);
    }

    /// Replaces the whole list.
    pub fn replace(&self, tasks: Vec<Task>) {
        *self.tasks.write() = tasks;
    }
}

#[async_trait]
impl TaskSource for StaticTaskSource {
    async fn list_candidate_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().clone())
    }
}
