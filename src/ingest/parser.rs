//! Turns one line of a session file into a [`SessionEntry`] (spec.md
//! §3, §4.4). The wire format is a loosely-typed JSON record — not
//! owned by this crate — so extraction works against a
//! [`serde_json::Value`] rather than a rigid `Deserialize` struct.

use chrono::{DateTime, Utc};
use serde_json::Value;
use specmem_core::ids::stable_digest16;
use std::path::{Path, PathBuf};

/// Phrases that mark a system-generated context-restoration summary
/// (spec.md §4.4) rather than an ordinary user prompt.
const CONTEXT_RESTORATION_MARKERS: &[&str] = &[
    "this session is being continued from a previous conversation",
    "session resumed after context compaction",
    "conversation history has been summarized",
];

/// Phrases indicating the text is sub-agent noise, not a top-level
/// assistant turn (spec.md §4.4).
const SUBAGENT_NOISE_MARKERS: &[&str] = &[
    "task tool",
    "subagent",
    "agent ",
    "agent completed",
    "agent returned",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    UserPrompt,
    ContextRestoration,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

/// A single parsed conversational turn, ready for embedding and
/// persistence.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub message_id: Option<String>,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub project: PathBuf,
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model: Option<String>,
    pub kind: EntryKind,
    pub entry_hash: String,
    pub content_hash: String,
}

impl SessionEntry {
    /// The persisted `Memory.content` form (spec.md §3): `[USER] ...`
    /// or `[CLAUDE] ...` with an optional ` [THINKING] ...` suffix.
    pub fn formatted_content(&self) -> String {
        match self.role {
            Role::User => format!("[USER] {}", self.content),
            Role::Assistant => match &self.thinking {
                Some(thinking) => format!("[CLAUDE] {} [THINKING] {}", self.content, thinking),
                None => format!("[CLAUDE] {}", self.content),
            },
        }
    }

    pub fn tag(&self) -> &'static str {
        match self.kind {
            EntryKind::UserPrompt => "user-prompt",
            EntryKind::ContextRestoration => "context-restoration",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseLineError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("non-finite or unparseable timestamp")]
    InvalidTimestamp,
}

/// Parses a single line. Returns `Ok(None)` when the line is a known
/// record type to skip, a garbage placeholder, or content-free.
pub fn parse_line(line: &str, source_path: &Path) -> Result<Option<SessionEntry>, ParseLineError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Value =
        serde_json::from_str(line).map_err(|e| ParseLineError::InvalidJson(e.to_string()))?;

    if value.get("type").and_then(Value::as_str) == Some("file-history-snapshot") {
        return Ok(None);
    }
    if value.get("teamMemberId").is_some() || value.get("team_member_id").is_some() {
        return Ok(None);
    }

    let role_str = value
        .get("message")
        .and_then(|m| m.get("role"))
        .or_else(|| value.get("role"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let role = match role_str {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return Ok(None),
    };

    let session_id = value
        .get("sessionId")
        .or_else(|| value.get("session_id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let message_id = value
        .get("message")
        .and_then(|m| m.get("id"))
        .or_else(|| value.get("uuid"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let project = value
        .get("cwd")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .unwrap_or_default();
    let model = value
        .get("message")
        .and_then(|m| m.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let timestamp = parse_timestamp(&value)?;

    let content_value = value.get("message").and_then(|m| m.get("content"));
    let (content, thinking, tool_calls) = match role {
        Role::User => (extract_user_text(content_value.unwrap_or(&Value::Null), &value), None, Vec::new()),
        Role::Assistant => extract_assistant_blocks(content_value.unwrap_or(&Value::Null)),
    };

    let Some(content) = content else {
        return Ok(None);
    };

    if is_garbage(&content) {
        return Ok(None);
    }
    if role == Role::Assistant && is_subagent_noise(&content) {
        return Ok(None);
    }

    let kind = if is_context_restoration(&content) {
        EntryKind::ContextRestoration
    } else {
        EntryKind::UserPrompt
    };

    let normalized_ts = timestamp.timestamp_millis().to_string();
    let entry_hash = stable_digest16(&["entry", &session_id, &normalized_ts]);
    let normalized_content = normalize_whitespace(&content);
    let content_hash = stable_digest16(&["content", role.as_str(), &normalized_content]);

    let _ = source_path;
    Ok(Some(SessionEntry {
        session_id,
        message_id,
        role,
        timestamp,
        project,
        content,
        thinking,
        tool_calls,
        model,
        kind,
        entry_hash,
        content_hash,
    }))
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ParseLineError> {
    let raw = value.get("timestamp").ok_or(ParseLineError::InvalidTimestamp)?;
    if let Some(s) = raw.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ParseLineError::InvalidTimestamp);
    }
    if let Some(ms) = raw.as_f64() {
        if !ms.is_finite() {
            return Err(ParseLineError::InvalidTimestamp);
        }
        return DateTime::from_timestamp_millis(ms as i64).ok_or(ParseLineError::InvalidTimestamp);
    }
    Err(ParseLineError::InvalidTimestamp)
}

fn extract_user_text(content: &Value, record: &Value) -> Option<String> {
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    if let Some(arr) = content.as_array() {
        if let Some(text) = arr.first().and_then(|v| v.get("text")).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    record.get("display").and_then(Value::as_str).map(str::to_string)
}

fn extract_assistant_blocks(content: &Value) -> (Option<String>, Option<String>, Vec<ToolCall>) {
    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    if let Some(arr) = content.as_array() {
        for block in arr {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text_parts.push(t.to_string());
                    }
                }
                Some("thinking") => {
                    if let Some(t) = block.get("thinking").and_then(Value::as_str) {
                        thinking_parts.push(t.to_string());
                    }
                }
                Some("tool_use") => {
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    tool_calls.push(ToolCall { name, input });
                }
                _ => {}
            }
        }
    } else if let Some(s) = content.as_str() {
        text_parts.push(s.to_string());
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join("\n"))
    };
    let thinking = if thinking_parts.is_empty() {
        None
    } else {
        Some(thinking_parts.join("\n"))
    };
    (content, thinking, tool_calls)
}

fn is_garbage(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < 5 {
        return true;
    }
    if trimmed == "Tools" || trimmed == "undefined" {
        return true;
    }
    trimmed.chars().all(|c| matches!(c, '[' | ']' | '{' | '}' | ':' | ' '))
}

fn is_subagent_noise(text: &str) -> bool {
    let lower = text.to_lowercase();
    SUBAGENT_NOISE_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn is_context_restoration(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONTEXT_RESTORATION_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn line(json: serde_json::Value) -> Result<Option<SessionEntry>, ParseLineError> {
        parse_line(&json.to_string(), Path::new("/tmp/history.jsonl"))
    }

    #[test]
    fn skips_file_history_snapshot_records() {
        let result = line(serde_json::json!({"type": "file-history-snapshot"})).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn skips_records_with_team_member_id() {
        let result = line(serde_json::json!({
            "teamMemberId": "abc",
            "message": {"role": "user", "content": "hello there"},
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn parses_user_string_content() {
        let entry = line(serde_json::json!({
            "sessionId": "s1",
            "cwd": "/home/me/project",
            "message": {"role": "user", "content": "please fix the bug"},
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
        .unwrap();
        assert_eq!(entry.content, "please fix the bug");
        assert_eq!(entry.formatted_content(), "[USER] please fix the bug");
    }

    #[test]
    fn parses_user_array_content_first_text() {
        let entry = line(serde_json::json!({
            "sessionId": "s1",
            "message": {"role": "user", "content": [{"text": "array form"}]},
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
        .unwrap();
        assert_eq!(entry.content, "array form");
    }

    #[test]
    fn assistant_aggregates_text_and_thinking_and_drops_tool_only() {
        let entry = line(serde_json::json!({
            "sessionId": "s1",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "let me check"},
                    {"type": "text", "text": "done"},
                    {"type": "tool_use", "name": "Read", "input": {"path": "a.rs"}},
                ],
            },
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
        .unwrap();
        assert_eq!(entry.content, "done");
        assert_eq!(entry.thinking.as_deref(), Some("let me check"));
        assert_eq!(entry.tool_calls.len(), 1);
        assert_eq!(entry.formatted_content(), "[CLAUDE] done [THINKING] let me check");
    }

    #[test]
    fn assistant_tool_only_is_dropped() {
        let result = line(serde_json::json!({
            "sessionId": "s1",
            "message": {
                "role": "assistant",
                "content": [{"type": "tool_use", "name": "Read", "input": {}}],
            },
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn garbage_placeholders_are_dropped() {
        for text in ["undefined", "Tools", "[::]", "ab"] {
            let result = line(serde_json::json!({
                "sessionId": "s1",
                "message": {"role": "user", "content": text},
                "timestamp": "2024-01-01T00:00:00Z",
            }))
            .unwrap();
            assert!(result.is_none(), "expected {text:?} to be dropped");
        }
    }

    #[test]
    fn subagent_noise_is_dropped() {
        let result = line(serde_json::json!({
            "sessionId": "s1",
            "message": {"role": "assistant", "content": "The Task tool reported the subagent completed."},
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn context_restoration_is_tagged_distinctly() {
        let entry = line(serde_json::json!({
            "sessionId": "s1",
            "message": {
                "role": "user",
                "content": "This session is being continued from a previous conversation that ran out of context.",
            },
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
        .unwrap();
        assert_eq!(entry.kind, EntryKind::ContextRestoration);
        assert_eq!(entry.tag(), "context-restoration");
    }

    #[test]
    fn invalid_timestamp_is_a_hard_error() {
        let result = line(serde_json::json!({
            "sessionId": "s1",
            "message": {"role": "user", "content": "hello there"},
            "timestamp": "not-a-date",
        }));
        assert!(matches!(result, Err(ParseLineError::InvalidTimestamp)));
    }

    #[test]
    fn entry_hash_is_deterministic_and_content_hash_distinguishes_role() {
        let a = line(serde_json::json!({
            "sessionId": "s1",
            "message": {"role": "user", "content": "identical text"},
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
        .unwrap();
        let b = line(serde_json::json!({
            "sessionId": "s1",
            "message": {"role": "user", "content": "identical text"},
            "timestamp": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
        .unwrap();
        assert_eq!(a.entry_hash, b.entry_hash);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn invalid_json_is_reported() {
        let result = parse_line("not json", Path::new("/tmp/x.jsonl"));
        assert!(matches!(result, Err(ParseLineError::InvalidJson(_))));
    }
}
