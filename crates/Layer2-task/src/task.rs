//! Task definition and types

use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference tying a task to a caller-defined business entity
/// (a feature folder and a task folder inside it)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLinkage {
    pub feature: String,
    pub task: String,
}

impl ExternalLinkage {
    pub fn new(feature: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            task: task.into(),
        }
    }
}

impl std::fmt::Display for ExternalLinkage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.feature, self.task)
    }
}

/// Progress counters maintained by the activity observer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub message_count: usize,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Partial progress update; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub message_count: Option<usize>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ProgressUpdate {
    pub fn message_count(count: usize) -> Self {
        Self {
            message_count: Some(count),
            ..Default::default()
        }
    }

    pub fn with_last_message(mut self, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.last_message = Some(text.into());
        self.last_message_at = Some(at);
        self
    }
}

/// Input for creating a ledger record
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub session_id: String,
    pub agent: String,
    pub model: Option<String>,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub parent_session_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub external_linkage: Option<ExternalLinkage>,
}

impl TaskSpec {
    pub fn new(
        session_id: impl Into<String>,
        agent: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent: agent.into(),
            model: None,
            description: description.into(),
            idempotency_key: None,
            parent_session_id: None,
            parent_message_id: None,
            external_linkage: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(
        mut self,
        session_id: impl Into<String>,
        message_id: Option<String>,
    ) -> Self {
        self.parent_session_id = Some(session_id.into());
        self.parent_message_id = message_id;
        self
    }

    pub fn with_external_linkage(mut self, linkage: ExternalLinkage) -> Self {
        self.external_linkage = Some(linkage);
        self
    }
}

/// A background task bound 1:1 to an external session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Unique task identifier
    pub id: TaskId,

    /// External session this task runs in
    pub session_id: String,

    /// Agent selector
    pub agent: String,

    /// Model id, when the caller pinned one
    pub model: Option<String>,

    pub description: String,

    /// Current lifecycle status
    pub status: TaskStatus,

    pub idempotency_key: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_active: DateTime<Utc>,

    pub parent_session_id: Option<String>,
    pub parent_message_id: Option<String>,

    pub external_linkage: Option<ExternalLinkage>,

    pub progress: TaskProgress,

    pub error_message: Option<String>,

    /// Out-of-band output file, once written
    pub output_path: Option<PathBuf>,
}

impl TaskRecord {
    pub(crate) fn from_spec(spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            session_id: spec.session_id,
            agent: spec.agent,
            model: spec.model,
            description: spec.description,
            status: TaskStatus::Spawned,
            idempotency_key: spec.idempotency_key,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_active: now,
            parent_session_id: spec.parent_session_id,
            parent_message_id: spec.parent_message_id,
            external_linkage: spec.external_linkage,
            progress: TaskProgress::default(),
            error_message: None,
            output_path: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Time since the task started running (or was created, if never started)
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let start = self.started_at.unwrap_or(self.created_at);
        (now - start).to_std().unwrap_or_default()
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_counts_from_start() {
        let mut record = TaskRecord::from_spec(TaskSpec::new("ses-1", "forager", "work"));
        let now = record.created_at + chrono::Duration::seconds(10);
        assert_eq!(record.age(now), Duration::from_secs(10));

        record.started_at = Some(record.created_at + chrono::Duration::seconds(4));
        assert_eq!(record.age(now), Duration::from_secs(6));

        // Clock skew never yields a negative span
        let before = record.last_active - chrono::Duration::seconds(1);
        assert_eq!(record.idle_for(before), Duration::ZERO);
    }

    #[test]
    fn test_new_record_defaults() {
        let record = TaskRecord::from_spec(
            TaskSpec::new("ses-1", "scout", "explore")
                .with_parent("parent-1", Some("msg-1".into()))
                .with_external_linkage(ExternalLinkage::new("auth", "01-login")),
        );

        assert_eq!(record.status, TaskStatus::Spawned);
        assert!(record.started_at.is_none());
        assert_eq!(record.parent_session_id.as_deref(), Some("parent-1"));
        assert_eq!(
            record.external_linkage.as_ref().map(|l| l.to_string()),
            Some("auth/01-login".to_string())
        );
    }
}
