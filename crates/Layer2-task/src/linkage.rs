//! Linkage store - best-effort business metadata for linked tasks
//!
//! When a spawn carries an [`ExternalLinkage`], the orchestrator patches a
//! small descriptor (idempotency key + session) into the caller's own
//! storage so the link survives this process. Failures here are reported to
//! the caller but never abort a spawn.

use crate::state::TaskStatus;
use crate::task::{ExternalLinkage, TaskId, TaskRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_foundation::{Error, JsonStore, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Session fields written next to the linkage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub task_id: TaskId,
    pub session_id: String,
    pub agent: String,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
}

/// Payload patched into the linkage target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkageRecord {
    pub idempotency_key: Option<String>,
    pub session: SessionDescriptor,
}

impl LinkageRecord {
    pub fn from_task(task: &TaskRecord) -> Self {
        Self {
            idempotency_key: task.idempotency_key.clone(),
            session: SessionDescriptor {
                task_id: task.id,
                session_id: task.session_id.clone(),
                agent: task.agent.clone(),
                status: task.status,
                updated_at: Utc::now(),
            },
        }
    }
}

/// Durable store keyed by external linkage
#[async_trait]
pub trait LinkageStore: Send + Sync {
    /// Merge `record` into whatever is already stored for `linkage`
    async fn persist(&self, linkage: &ExternalLinkage, record: &LinkageRecord) -> Result<()>;
}

/// JSON files at `<base>/<feature>/<task>.json`
///
/// Only the `idempotencyKey` and `session` fields are written; any other
/// fields already in the file are kept.
#[derive(Debug, Clone)]
pub struct JsonLinkageStore {
    store: JsonStore,
}

impl JsonLinkageStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(base_dir),
        }
    }

    pub fn file_path(&self, linkage: &ExternalLinkage) -> Result<PathBuf> {
        Ok(self.store.file_path(&Self::filename(linkage)?))
    }

    /// Read back a stored record, if any
    pub fn load(&self, linkage: &ExternalLinkage) -> Result<Option<LinkageRecord>> {
        self.store.load_optional(&Self::filename(linkage)?)
    }

    fn filename(linkage: &ExternalLinkage) -> Result<String> {
        for part in [linkage.feature.as_str(), linkage.task.as_str()] {
            let safe = !matches!(part, "" | "." | "..")
                && !part.contains(|c: char| c == '/' || c == '\\');
            if !safe {
                return Err(Error::InvalidInput(format!(
                    "Invalid linkage component '{}'",
                    part
                )));
            }
        }
        Ok(format!("{}/{}.json", linkage.feature, linkage.task))
    }
}

#[async_trait]
impl LinkageStore for JsonLinkageStore {
    async fn persist(&self, linkage: &ExternalLinkage, record: &LinkageRecord) -> Result<()> {
        let filename = Self::filename(linkage)?;
        let patch = serde_json::to_value(record)?;

        // JsonStore does blocking file I/O
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.patch(&filename, &patch))
            .await
            .map_err(|e| Error::Storage(format!("Linkage write task failed: {}", e)))??;

        debug!("Persisted linkage {} for task {}", linkage, record.session.task_id);
        Ok(())
    }
}
