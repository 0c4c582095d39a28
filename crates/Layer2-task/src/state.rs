//! Task state machine

use serde::{Deserialize, Serialize};

/// Lifecycle status of a background task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Record created, session exists, prompt not dispatched yet
    Spawned,

    /// Waiting for something before dispatch
    Pending,

    /// Prompt dispatched, session is working
    Running,

    /// Paused waiting on external input
    Blocked,

    /// Session finished normally
    Completed,

    /// Dispatch or runtime error
    Error,

    /// Cancelled by the caller
    Cancelled,

    /// Finished without achieving its goal
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Spawned,
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Blocked,
        TaskStatus::Completed,
        TaskStatus::Error,
        TaskStatus::Cancelled,
        TaskStatus::Failed,
    ];

    /// Statuses reachable from this one
    pub fn allowed_transitions(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Spawned => &[Pending, Running, Cancelled, Error],
            Pending => &[Running, Cancelled, Error],
            Running => &[Completed, Error, Cancelled, Blocked, Failed],
            Blocked => &[Running, Cancelled, Failed],
            Completed | Error | Cancelled | Failed => &[],
        }
    }

    /// Check whether `self -> next` is in the transition table
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    /// Check if task is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    /// Check if task is still active (not terminal)
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Get display name for the state
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Spawned => "spawned",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
