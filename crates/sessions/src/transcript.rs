//! Append-only JSONL transcripts.
//!
//! Each session gets a `<session_id>.jsonl` file under the sessions
//! directory; every message is appended as a single JSON line. Timestamps
//! on consecutive lines are non-decreasing because each session has
//! exactly one writer (its actor) and lines are stamped at append time.

use std::path::{Path, PathBuf};

use chrono::Utc;
use osa_domain::error::{Error, Result};
use osa_domain::message::{ContentPart, Message, MessageContent, Role, ToolCall};
use serde::{Deserialize, Serialize};

/// A single transcript line. Unknown fields are ignored on load;
/// unparseable lines are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub timestamp: String,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Array of `{ "text": .., "signature": .. }` objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_blocks: Option<serde_json::Value>,
}

/// Writes append-only JSONL transcript files.
pub struct TranscriptWriter {
    base_dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }

    /// Append one or more lines to a session's transcript.
    pub fn append(&self, session_id: &str, lines: &[TranscriptLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.base_dir).map_err(Error::Io)?;

        let mut buf = String::new();
        for line in lines {
            let json = serde_json::to_string(line)
                .map_err(|e| Error::Other(format!("serializing transcript line: {e}")))?;
            buf.push_str(&json);
            buf.push('\n');
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(session_id))
            .map_err(Error::Io)?;
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;

        Ok(())
    }

    /// Helper to create a transcript line stamped with the current time.
    pub fn line(role: &str, content: &str) -> TranscriptLine {
        TranscriptLine {
            timestamp: Utc::now().to_rfc3339(),
            role: role.to_owned(),
            content: content.to_owned(),
            tool_calls: None,
            tool_call_id: None,
            channel: None,
            thinking_blocks: None,
        }
    }

    /// Read back a transcript. Missing file = empty session.
    pub fn read(&self, session_id: &str) -> Result<Vec<TranscriptLine>> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut lines = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(line) {
                Ok(tl) => lines.push(tl),
                Err(e) => {
                    tracing::warn!(
                        session_id = session_id,
                        error = %e,
                        "skipping malformed transcript line"
                    );
                }
            }
        }
        Ok(lines)
    }

    /// Whether a transcript exists on disk for this session.
    pub fn exists(&self, session_id: &str) -> bool {
        self.path(session_id).exists()
    }
}

/// Reconstruct the logical message sequence from transcript lines.
///
/// Assistant lines rebuild their `ToolUse` (and thinking) parts; tool
/// lines require a `tool_call_id` and are skipped without one; unknown
/// roles are skipped.
pub fn lines_to_messages(lines: &[TranscriptLine]) -> Vec<Message> {
    let mut messages = Vec::new();

    for line in lines {
        let role = match line.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            "system" => Role::System,
            _ => continue,
        };

        match role {
            Role::Tool => {
                if let Some(call_id) = &line.tool_call_id {
                    messages.push(Message::tool_result(call_id, &line.content));
                }
            }
            Role::Assistant => {
                let mut parts: Vec<ContentPart> = Vec::new();
                if let Some(blocks) = line.thinking_blocks.as_ref().and_then(|v| v.as_array()) {
                    for block in blocks {
                        let text = block
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or("")
                            .to_string();
                        let signature = block
                            .get("signature")
                            .and_then(|s| s.as_str())
                            .map(String::from);
                        parts.push(ContentPart::Thinking { text, signature });
                    }
                }
                if !line.content.is_empty() {
                    parts.push(ContentPart::Text {
                        text: line.content.clone(),
                    });
                }
                if let Some(calls) = &line.tool_calls {
                    for tc in calls {
                        parts.push(ContentPart::ToolUse {
                            id: tc.call_id.clone(),
                            name: tc.tool_name.clone(),
                            input: tc.arguments.clone(),
                        });
                    }
                }
                if parts.is_empty() {
                    messages.push(Message::assistant(line.content.clone()));
                } else if line.tool_calls.is_none() && line.thinking_blocks.is_none() {
                    messages.push(Message::assistant(line.content.clone()));
                } else {
                    messages.push(Message {
                        role: Role::Assistant,
                        content: MessageContent::Parts(parts),
                    });
                }
            }
            _ => {
                messages.push(Message {
                    role,
                    content: MessageContent::Text(line.content.clone()),
                });
            }
        }
    }

    messages
}
