//! In-memory ledger.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{LedgerRecord, ProcessingLedger};
use crate::errors::Result;

/// Process-local ledger. Not durable; meant for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<String, LedgerRecord>>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ProcessingLedger for InMemoryLedger {
    async fn has_succeeded(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .get(task_id)
            .is_some_and(|record| record.success))
    }

    async fn record(&self, task_id: &str, record: LedgerRecord) -> Result<()> {
        self.records.lock().insert(task_id.to_string(), record);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<LedgerRecord>> {
        let mut records: Vec<LedgerRecord> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(records)
    }

    async fn get(&self, task_id: &str) -> Result<Option<LedgerRecord>> {
        Ok(self.records.lock().get(task_id).cloned())
    }
}
