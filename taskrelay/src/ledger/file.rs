//! JSON-file-backed ledger that survives process restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{LedgerRecord, ProcessingLedger};
use crate::errors::{ResilienceError, Result};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, LedgerRecord>,
}

/// Ledger persisted as a single JSON document.
///
/// Every write rewrites the whole document to a sibling temp file and renames
/// it over the original, so a crash mid-write leaves the previous version
/// intact. Only one process may own a given file.
#[derive(Debug)]
pub struct JsonFileLedger {
    path: PathBuf,
    records: Mutex<BTreeMap<String, LedgerRecord>>,
}

impl JsonFileLedger {
    /// Opens the ledger at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => {
                let file: LedgerFile = serde_json::from_slice(&bytes).map_err(|e| {
                    ResilienceError::Ledger(format!("corrupt ledger {}: {e}", path.display()))
                })?;
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(ResilienceError::Ledger(format!(
                    "cannot read ledger {}: {e}",
                    path.display()
                )))
            }
        };

        debug!(path = %path.display(), records = records.len(), "Opened ledger");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Location of the ledger document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, LedgerRecord>) -> Result<()> {
        let document = LedgerFile {
            version: FORMAT_VERSION,
            records: records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await.map_err(|e| {
            ResilienceError::Ledger(format!("cannot write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            ResilienceError::Ledger(format!("cannot replace {}: {e}", self.path.display()))
        })?;
        Ok(())
    }
}

#[async_trait]
impl ProcessingLedger for JsonFileLedger {
    async fn has_succeeded(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .await
            .get(task_id)
            .is_some_and(|record| record.success))
    }

    async fn record(&self, task_id: &str, record: LedgerRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        let previous = records.insert(task_id.to_string(), record);

        if let Err(err) = self.persist(&records).await {
            // Keep memory consistent with what is on disk.
            match previous {
                Some(previous) => records.insert(task_id.to_string(), previous),
                None => records.remove(task_id),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<LedgerRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn get(&self, task_id: &str) -> Result<Option<LedgerRecord>> {
        Ok(self.records.lock().await.get(task_id).cloned())
    }
}
