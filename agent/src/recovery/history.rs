//! Append-only failure history (`failures.jsonl`)

use std::sync::RwLock;

use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::models::failure::FailureRecord;

pub struct FailureLog {
    file: File,
    records: RwLock<Vec<FailureRecord>>,
    append_lock: Mutex<()>,
}

impl FailureLog {
    /// Load the history; unparsable lines are skipped
    pub async fn open(file: File) -> Result<Self, AgentError> {
        let mut records = Vec::new();
        if let Some(content) = file.read_string_opt().await? {
            for (i, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<FailureRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(
                        "Skipping line {} of {}: {}",
                        i + 1,
                        file.path().display(),
                        e
                    ),
                }
            }
        }
        Ok(Self {
            file,
            records: RwLock::new(records),
            append_lock: Mutex::new(()),
        })
    }

    pub async fn append(&self, record: FailureRecord) -> Result<(), AgentError> {
        let line = serde_json::to_string(&record)?;
        let _guard = self.append_lock.lock().await;
        self.file.append_line(&line).await?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.push(record);
        Ok(())
    }

    pub fn for_template(&self, template_id: &str) -> Vec<FailureRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| r.template_id == template_id)
            .cloned()
            .collect()
    }

    pub fn for_deployment(&self, deployment_id: &str) -> Vec<FailureRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| r.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    /// Whether this exact combination already failed
    pub fn has_failed(&self, fingerprint: &str) -> bool {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.iter().any(|r| r.fingerprint == fingerprint)
    }

    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
