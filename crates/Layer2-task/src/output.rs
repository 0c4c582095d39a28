//! Task output collection
//!
//! Output is the assistant side of a session transcript. Anything over the
//! inline limit is written to `<output_dir>/<task-id>.output` and handed
//! back by path.

use crate::session::{MessagePart, MessageRole, SessionMessage};
use crate::task::TaskId;
use conductor_foundation::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Collected output, inline or by reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputPayload {
    Inline { text: String },
    File { path: PathBuf, bytes: usize },
}

impl OutputPayload {
    pub fn inline_text(&self) -> Option<&str> {
        match self {
            OutputPayload::Inline { text } => Some(text),
            OutputPayload::File { .. } => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputPayload::File { path, .. } => Some(path),
            OutputPayload::Inline { .. } => None,
        }
    }
}

/// Text and tool results of every assistant message, in order
pub fn collect_text(messages: &[SessionMessage]) -> String {
    let mut sections = Vec::new();
    for message in messages.iter().filter(|m| m.role == MessageRole::Assistant) {
        for part in &message.parts {
            match part {
                MessagePart::Text { text } if !text.trim().is_empty() => {
                    sections.push(text.clone());
                }
                MessagePart::Text { .. } => {}
                MessagePart::ToolResult { tool, output } => {
                    sections.push(format!("[{}]\n{}", tool, output));
                }
            }
        }
    }
    sections.join("\n\n")
}

/// Output file location for a task
pub fn output_file(output_dir: &Path, id: TaskId) -> PathBuf {
    output_dir.join(format!("{}.output", id))
}

/// Keep `text` inline when it fits, otherwise write it out
pub async fn materialize(
    text: String,
    inline_limit: usize,
    output_dir: &Path,
    id: TaskId,
) -> Result<OutputPayload> {
    if text.len() <= inline_limit {
        return Ok(OutputPayload::Inline { text });
    }

    let path = output_file(output_dir, id);
    tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
        Error::Storage(format!("Failed to create {}: {}", output_dir.display(), e))
    })?;
    tokio::fs::write(&path, text.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("Failed to write {}: {}", path.display(), e)))?;

    debug!("Wrote {} bytes of output for task {} to {}", text.len(), id, path.display());
    Ok(OutputPayload::File {
        path,
        bytes: text.len(),
    })
}
