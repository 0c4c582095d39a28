//! External session runtime ports
//!
//! The agent runtime that actually executes prompts lives outside this
//! crate. [`SessionClient`] is the narrow surface the orchestrator and the
//! activity observer need from it; [`AgentValidator`] gates which agents may
//! be spawned at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_foundation::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// Session types
// ============================================================================

/// Status reported by the runtime for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry,
    Completed,
    Unknown,
}

impl SessionStatus {
    /// The runtime says the session has nothing left to do
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionStatus::Idle | SessionStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One part of a session message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ToolResult { tool: String, output: String },
}

/// A message in a session transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SessionMessage {
    pub fn assistant(id: impl Into<String>, parts: Vec<MessagePart>) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::Assistant,
            parts,
            created_at: Some(Utc::now()),
        }
    }

    /// Concatenated text parts (tool results excluded)
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::ToolResult { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Prompt handed to the runtime for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub agent: String,
    pub model: Option<String>,
    pub content: String,
}

/// Agent runtime client
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Create a session, returning its id
    async fn create(&self, title: &str, parent_session_id: Option<&str>) -> Result<String>;

    /// Dispatch a prompt. May run until the session finishes; callers that
    /// must not block spawn it onto a task.
    async fn prompt(&self, session_id: &str, request: PromptRequest) -> Result<()>;

    async fn abort(&self, session_id: &str) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<SessionStatus>;

    /// Status of every session the runtime knows about
    async fn statuses(&self) -> Result<HashMap<String, SessionStatus>>;

    /// Ordered transcript of a session
    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>>;
}

// ============================================================================
// Agent validation
// ============================================================================

/// Result of an agent check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl AgentValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Gate consulted once per spawn, before any session exists
#[async_trait]
pub trait AgentValidator: Send + Sync {
    async fn validate(&self, agent: &str) -> AgentValidation;
}

/// Maximum accepted agent name length
const MAX_AGENT_NAME_LEN: usize = 64;

/// Allow-list validator with a name-safety check.
///
/// An empty allow-list accepts any safe name.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentValidator {
    allowed: HashSet<String>,
}

impl StaticAgentValidator {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: agents.into_iter().map(Into::into).collect(),
        }
    }

    /// Accept any safe name
    pub fn permissive() -> Self {
        Self::default()
    }

    fn check_name(agent: &str) -> std::result::Result<(), String> {
        if agent.is_empty() {
            return Err("Agent name is empty".to_string());
        }
        if agent.len() > MAX_AGENT_NAME_LEN {
            return Err(format!(
                "Agent name exceeds {} characters",
                MAX_AGENT_NAME_LEN
            ));
        }
        if agent.starts_with('.') || agent.starts_with('-') {
            return Err(format!("Agent name '{}' has an invalid prefix", agent));
        }
        if let Some(c) = agent
            .chars()
            .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(format!(
                "Agent name '{}' contains invalid character '{}'",
                agent, c
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentValidator for StaticAgentValidator {
    async fn validate(&self, agent: &str) -> AgentValidation {
        if let Err(e) = Self::check_name(agent) {
            return AgentValidation::invalid(e);
        }

        if !self.allowed.is_empty() && !self.allowed.contains(agent) {
            let mut known: Vec<&str> = self.allowed.iter().map(String::as_str).collect();
            known.sort_unstable();
            return AgentValidation::invalid(format!(
                "Unknown agent '{}' (available: {})",
                agent,
                known.join(", ")
            ));
        }

        AgentValidation::ok()
    }
}
