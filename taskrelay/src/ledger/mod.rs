//! Durable record of which tasks have been processed.
//!
//! The ledger is the source of truth for "has this task already been done".
//! A task whose record has `success = true` must never be selected again.

mod file;
mod memory;

pub use file::JsonFileLedger;
pub use memory::InMemoryLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Terminal bookkeeping for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// The task this record belongs to.
    pub task_id: String,
    /// When the run finished.
    pub processed_at: DateTime<Utc>,
    /// Whether every stage succeeded.
    pub success: bool,
    /// Stage outputs on success; diagnostic context on failure.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Human-readable failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The task must not be selected again even though it failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub permanent_failure: bool,
}

impl LedgerRecord {
    /// A success record.
    #[must_use]
    pub fn succeeded(
        task_id: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            processed_at: Utc::now(),
            success: true,
            metadata,
            error: None,
            permanent_failure: false,
        }
    }

    /// A failure record; the task stays eligible for a later run.
    #[must_use]
    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            processed_at: Utc::now(),
            success: false,
            metadata: serde_json::Map::new(),
            error: Some(error.into()),
            permanent_failure: false,
        }
    }

    /// Marks the failure as permanent.
    #[must_use]
    pub fn permanent(mut self) -> Self {
        self.permanent_failure = true;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True if the orchestrator must skip this task.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.success || self.permanent_failure
    }
}

/// Storage backend for [`LedgerRecord`]s, keyed by task id.
///
/// Writes overwrite any earlier record for the same task.
#[async_trait]
pub trait ProcessingLedger: Send + Sync {
    /// True if a success record exists for `task_id`.
    async fn has_succeeded(&self, task_id: &str) -> Result<bool>;

    /// Stores `record` under `task_id`.
    async fn record(&self, task_id: &str, record: LedgerRecord) -> Result<()>;

    /// Every stored record.
    async fn list_records(&self) -> Result<Vec<LedgerRecord>>;

    /// The record for `task_id`, if any.
    async fn get(&self, task_id: &str) -> Result<Option<LedgerRecord>>;

    /// True if the task succeeded or was marked permanently failed.
    async fn is_settled(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .get(task_id)
            .await?
            .is_some_and(|record| record.is_settled()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_constructors() {
        let ok = LedgerRecord::succeeded("T1", serde_json::Map::new())
            .with_metadata("url", serde_json::json!("https://example.test/v/1"));
        assert!(ok.success);
        assert!(ok.is_settled());
        assert!(ok.error.is_none());

        let failed = LedgerRecord::failed("T2", "caption timed out");
        assert!(!failed.success);
        assert!(!failed.is_settled());
        assert!(failed.permanent().is_settled());
    }

    #[test]
    fn test_record_serde_roundtrip_skips_defaults() {
        let record = LedgerRecord::failed("T3", "boom");
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("permanent_failure").is_none());

        let back: LedgerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
