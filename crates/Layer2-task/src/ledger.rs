//! Task Ledger - authoritative record set for background tasks
//!
//! The ledger is the single authority for lifecycle correctness:
//! - every status change is checked against the transition table in
//!   [`TaskStatus::allowed_transitions`]
//! - an idempotency key maps to at most one record
//! - terminal records are immutable (apart from the output reference)
//!
//! All mutations happen under one short, non-async lock, so each operation
//! is atomic with respect to the others.

use crate::state::TaskStatus;
use crate::task::{ExternalLinkage, ProgressUpdate, TaskId, TaskRecord, TaskSpec};
use chrono::Utc;
use conductor_foundation::Error;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Ledger errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Idempotency key '{key}' is already mapped to task {existing}")]
    DuplicateIdempotencyKey { key: String, existing: TaskId },

    #[error("Illegal transition for task {id}: {from} -> {to}")]
    IllegalTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} is {status} and can no longer be modified")]
    Terminal { id: TaskId, status: TaskStatus },
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => Error::NotFound(err.to_string()),
            _ => Error::Lifecycle(err.to_string()),
        }
    }
}

/// Extra fields recorded alongside a status change
#[derive(Debug, Clone, Default)]
pub struct StatusExtra {
    pub error_message: Option<String>,
}

impl StatusExtra {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
        }
    }
}

/// Filter for [`TaskLedger::list`]; all given criteria must match
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub parent_session_id: Option<String>,
    pub agent: Option<String>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_parent_session(mut self, session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(ref statuses) = self.statuses {
            if !statuses.contains(&record.status) {
                return false;
            }
        }

        if let Some(ref parent) = self.parent_session_id {
            if record.parent_session_id.as_ref() != Some(parent) {
                return false;
            }
        }

        if let Some(ref agent) = self.agent {
            if &record.agent != agent {
                return false;
            }
        }

        true
    }
}

#[derive(Default)]
struct LedgerInner {
    records: HashMap<TaskId, TaskRecord>,
    /// Insertion sequence, breaks ties between equal creation timestamps
    sequence: HashMap<TaskId, u64>,
    next_seq: u64,
    by_idempotency_key: HashMap<String, TaskId>,
    by_linkage: HashMap<ExternalLinkage, TaskId>,
    by_session: HashMap<String, TaskId>,
}

/// Task Ledger
#[derive(Default)]
pub struct TaskLedger {
    inner: RwLock<LedgerInner>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new record in `spawned` status.
    ///
    /// Fails if the idempotency key is already mapped; callers are expected
    /// to look the key up first.
    pub fn create(&self, spec: TaskSpec) -> Result<TaskRecord, LedgerError> {
        let mut inner = self.inner.write();

        if let Some(ref key) = spec.idempotency_key {
            if let Some(existing) = inner.by_idempotency_key.get(key) {
                return Err(LedgerError::DuplicateIdempotencyKey {
                    key: key.clone(),
                    existing: *existing,
                });
            }
        }

        let record = TaskRecord::from_spec(spec);
        let id = record.id;

        if let Some(ref key) = record.idempotency_key {
            inner.by_idempotency_key.insert(key.clone(), id);
        }
        if let Some(ref linkage) = record.external_linkage {
            // Newer record supersedes the previous one for this linkage
            if let Some(previous) = inner.by_linkage.insert(linkage.clone(), id) {
                debug!("Linkage {} moved from task {} to {}", linkage, previous, id);
            }
        }
        inner.by_session.insert(record.session_id.clone(), id);

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.sequence.insert(id, seq);
        inner.records.insert(id, record.clone());

        debug!("Ledger created task {} (session {})", id, record.session_id);
        Ok(record)
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.inner.read().records.get(&id).cloned()
    }

    pub fn get_by_idempotency_key(&self, key: &str) -> Option<TaskRecord> {
        let inner = self.inner.read();
        inner
            .by_idempotency_key
            .get(key)
            .and_then(|id| inner.records.get(id))
            .cloned()
    }

    pub fn get_by_external_linkage(&self, linkage: &ExternalLinkage) -> Option<TaskRecord> {
        let inner = self.inner.read();
        inner
            .by_linkage
            .get(linkage)
            .and_then(|id| inner.records.get(id))
            .cloned()
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Option<TaskRecord> {
        let inner = self.inner.read();
        inner
            .by_session
            .get(session_id)
            .and_then(|id| inner.records.get(id))
            .cloned()
    }

    /// Apply a status transition.
    ///
    /// Sets `started_at` on the first entry into `running` and `completed_at`
    /// on the first entry into a terminal status. Unknown ids and transitions
    /// outside the table fail.
    pub fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        extra: Option<StatusExtra>,
    ) -> Result<TaskRecord, LedgerError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;

        let from = record.status;
        if !from.can_transition_to(status) {
            warn!("Rejected transition for task {}: {} -> {}", id, from, status);
            return Err(LedgerError::IllegalTransition {
                id,
                from,
                to: status,
            });
        }

        let now = Utc::now();
        record.status = status;
        record.last_active = now;

        if status == TaskStatus::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if status.is_terminal() && record.completed_at.is_none() {
            record.completed_at = Some(now);
        }
        if let Some(message) = extra.and_then(|e| e.error_message) {
            record.error_message = Some(message);
        }

        debug!("Task {} transitioned {} -> {}", id, from, status);
        Ok(record.clone())
    }

    /// Merge progress fields and bump `last_active`. Never touches status.
    pub fn update_progress(
        &self,
        id: TaskId,
        update: ProgressUpdate,
    ) -> Result<TaskRecord, LedgerError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;

        if record.is_terminal() {
            return Err(LedgerError::Terminal {
                id,
                status: record.status,
            });
        }

        if let Some(count) = update.message_count {
            record.progress.message_count = count;
        }
        if let Some(text) = update.last_message {
            record.progress.last_message = Some(text);
        }
        if let Some(at) = update.last_message_at {
            record.progress.last_message_at = Some(at);
        }
        record.last_active = Utc::now();

        Ok(record.clone())
    }

    /// Record the out-of-band output file. The first path written wins.
    pub fn set_output_path(&self, id: TaskId, path: PathBuf) -> Result<TaskRecord, LedgerError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;

        if record.output_path.is_none() {
            record.output_path = Some(path);
        }
        Ok(record.clone())
    }

    /// Remove a record and every index entry pointing at it
    pub fn delete(&self, id: TaskId) -> Option<TaskRecord> {
        let mut inner = self.inner.write();
        let record = inner.records.remove(&id)?;
        inner.sequence.remove(&id);

        if let Some(ref key) = record.idempotency_key {
            if inner.by_idempotency_key.get(key) == Some(&id) {
                inner.by_idempotency_key.remove(key);
            }
        }
        if let Some(ref linkage) = record.external_linkage {
            if inner.by_linkage.get(linkage) == Some(&id) {
                inner.by_linkage.remove(linkage);
            }
        }
        if inner.by_session.get(&record.session_id) == Some(&id) {
            inner.by_session.remove(&record.session_id);
        }

        debug!("Ledger deleted task {}", id);
        Some(record)
    }

    /// Records matching the filter, oldest first
    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let inner = self.inner.read();
        let mut records: Vec<(u64, &TaskRecord)> = inner
            .records
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| (inner.sequence.get(&r.id).copied().unwrap_or(u64::MAX), r))
            .collect();

        records.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        records.into_iter().map(|(_, r)| r.clone()).collect()
    }

    /// All non-terminal records, oldest first
    pub fn get_active(&self) -> Vec<TaskRecord> {
        let filter = TaskFilter {
            statuses: Some(
                TaskStatus::ALL
                    .into_iter()
                    .filter(|s| s.is_active())
                    .collect(),
            ),
            ..Default::default()
        };
        self.list(&filter)
    }

    /// Count of records per status (every status present, possibly zero)
    pub fn count_by_status(&self) -> HashMap<TaskStatus, usize> {
        let inner = self.inner.read();
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for record in inner.records.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}
