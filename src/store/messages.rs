//! Message send/read operations (spec.md §4.5).

use super::channels;
use super::CoordinationStore;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use specmem_core::bus::{Event, Topic};
use specmem_core::error::{SpecMemError, SpecMemResult};
use std::collections::HashSet;
use std::sync::OnceLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Status,
    Question,
    Update,
    Broadcast,
    HelpRequest,
    HelpResponse,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Status => "status",
            MessageType::Question => "question",
            MessageType::Update => "update",
            MessageType::Broadcast => "broadcast",
            MessageType::HelpRequest => "help_request",
            MessageType::HelpResponse => "help_response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastType {
    Status,
    Progress,
    Announcement,
}

impl BroadcastType {
    fn as_str(self) -> &'static str {
        match self {
            BroadcastType::Status => "status",
            BroadcastType::Progress => "progress",
            BroadcastType::Announcement => "announcement",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: String,
    pub priority: String,
    pub thread_id: Option<Uuid>,
    pub mentions: Vec<String>,
    pub read_by: Vec<String>,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(super) struct MessageRow {
    pub id: Uuid,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: String,
    pub priority: String,
    pub thread_id: Option<Uuid>,
    pub mentions: Vec<String>,
    pub read_by: Vec<String>,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(r: MessageRow) -> Self {
        Message {
            id: r.id,
            channel_id: r.channel_id,
            sender_id: r.sender_id,
            sender_name: r.sender_name,
            content: r.content,
            message_type: r.message_type,
            priority: r.priority,
            thread_id: r.thread_id,
            mentions: r.mentions,
            read_by: r.read_by,
            project_path: r.project_path,
            created_at: r.created_at,
        }
    }
}

pub struct SendMessageRequest<'a> {
    pub sender_id: &'a str,
    pub sender_name: Option<&'a str>,
    pub content: &'a str,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub channel: &'a str,
    pub task_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub thread_id: Option<Uuid>,
}

fn mentions_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([a-z0-9_-]+)").expect("mentions regex is valid"))
}

/// Lowercase, unique, order-preserving `@mentions` (spec.md §3).
pub fn parse_mentions(content: &str) -> Vec<String> {
    let lower = content.to_lowercase();
    let mut seen = HashSet::new();
    let mut mentions = Vec::new();
    for cap in mentions_regex().captures_iter(&lower) {
        let m = cap[1].to_string();
        if seen.insert(m.clone()) {
            mentions.push(m);
        }
    }
    mentions
}

pub async fn send_message(store: &CoordinationStore, req: SendMessageRequest<'_>) -> SpecMemResult<Message> {
    if req.content.trim().is_empty() {
        return Err(SpecMemError::InvalidInput("message content must not be empty".into()));
    }

    enforce_channel_assignment(store, req.sender_id, req.channel)?;

    let pool = store.pool().await?;
    let channel_id = channels::resolve_channel(store, &pool, req.channel, req.task_id, req.project_id).await?;
    let mentions = parse_mentions(req.content);
    let sender_name = req.sender_name.unwrap_or(req.sender_id);

    let row: MessageRow = sqlx::query_as(
        "INSERT INTO messages (channel_id, project_path, sender_id, sender_name, content, message_type, priority, thread_id, mentions)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING id, channel_id, sender_id, sender_name, content, message_type, priority, thread_id, mentions, read_by, project_path, created_at",
    )
    .bind(channel_id.as_str())
    .bind(store.project().path_str())
    .bind(req.sender_id)
    .bind(sender_name)
    .bind(req.content)
    .bind(req.message_type.as_str())
    .bind(req.priority.as_str())
    .bind(req.thread_id)
    .bind(&mentions)
    .fetch_one(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    channels::touch_activity(&pool, channel_id.as_str()).await?;
    write_latest_team_message_file(store, &row);

    store
        .bus()
        .post(Event::new(
            Topic::CoordinationMessage,
            req.sender_id,
            serde_json::json!({"channel_id": channel_id.as_str(), "message_type": req.message_type.as_str()}),
        ))
        .fire_and_forget();

    Ok(row.into())
}

fn enforce_channel_assignment(store: &CoordinationStore, sender_id: &str, requested_channel: &str) -> SpecMemResult<()> {
    let Some(assignment) = channels::read_channel_assignment(store.project(), sender_id) else {
        return Ok(());
    };
    if assignment == "main" || assignment == "default" || assignment == "broadcast" {
        return Ok(());
    }
    let allowed = matches!(requested_channel, "main" | "default" | "broadcast") || requested_channel == assignment;
    if allowed {
        Ok(())
    } else {
        Err(SpecMemError::Forbidden(
            "Agents can only post to their assigned channel or main; to reach other swarms, post to main and @mention them".into(),
        ))
    }
}

/// Best-effort "latest team message" snapshot for an external UI,
/// under the project's sockets directory (spec.md §4.5). Never fails
/// the caller on I/O trouble.
fn write_latest_team_message_file(store: &CoordinationStore, row: &MessageRow) {
    let dir = store.project().sockets_dir();
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let payload = serde_json::json!({
        "sender": row.sender_name,
        "content": row.content,
        "channel_id": row.channel_id,
        "created_at": row.created_at.to_rfc3339(),
    });
    let _ = std::fs::write(dir.join("latest-team-message.json"), payload.to_string());
}

#[derive(Debug, Clone, Default)]
pub struct ReadMessagesQuery {
    pub agent_id: Option<String>,
    pub limit: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub channel: Option<String>,
    pub task_id: Option<String>,
    pub project_id: Option<String>,
    pub mentions_only: bool,
    pub unread_only: bool,
    pub include_broadcasts: bool,
    pub include_swarms: bool,
    /// Pass-through flag: the external compression facility is out of
    /// scope (spec.md §1/§6); when set, content is returned unmodified
    /// rather than silently ignoring the caller's intent.
    pub compress: bool,
}

pub async fn read_messages(store: &CoordinationStore, query: ReadMessagesQuery) -> SpecMemResult<Vec<Message>> {
    let pool = store.pool().await?;
    let limit = query.limit.unwrap_or(10).clamp(1, 100);

    let mut channel_ids: Vec<String> = Vec::new();
    if let Some(task_id) = &query.task_id {
        channel_ids.push(
            channels::resolve_channel(store, &pool, "main", Some(task_id), None)
                .await?
                .0,
        );
    } else if let Some(project_id) = &query.project_id {
        channel_ids.push(
            channels::resolve_channel(store, &pool, "main", None, Some(project_id))
                .await?
                .0,
        );
    } else {
        let base = query.channel.as_deref().unwrap_or("main");
        if base == "all" {
            channel_ids.push(store.project().channel_id("main").0);
            for n in 1..=5 {
                channel_ids.push(store.project().channel_id(&format!("swarm-{n}")).0);
            }
        } else {
            channel_ids.push(store.project().channel_id(base).0);
        }
    }
    if query.include_swarms {
        for n in 1..=5 {
            let id = store.project().channel_id(&format!("swarm-{n}")).0;
            if !channel_ids.contains(&id) {
                channel_ids.push(id);
            }
        }
    }
    if query.include_broadcasts {
        let id = store.project().channel_id("broadcast").0;
        if !channel_ids.contains(&id) {
            channel_ids.push(id);
        }
    }

    let agent_id = query.agent_id.clone();
    let session_start = store.session_start().await;

    // Split into project-scoped rows and global-broadcast rows with a
    // UNION ALL rather than an `OR` across `project_path`, so each half
    // keeps using its own partial/equality index (spec.md §4.5). Both
    // halves also exclude anything older than the current session-start
    // snapshot, so a `clear_team_messages` reset is visible on the next
    // read even if the underlying row was never deleted.
    let rows: Vec<MessageRow> = sqlx::query_as(
        r#"
        SELECT id, channel_id, sender_id, sender_name, content, message_type, priority, thread_id, mentions, read_by, project_path, created_at
        FROM messages
        WHERE channel_id = ANY($1) AND project_path = $2
          AND created_at >= $8
          AND ($3::timestamptz IS NULL OR created_at > $3)
          AND ($4 = false OR ($5::text IS NOT NULL AND $5 = ANY(mentions)))
          AND ($6 = false OR ($5::text IS NOT NULL AND NOT ($5 = ANY(read_by))))
        UNION ALL
        SELECT id, channel_id, sender_id, sender_name, content, message_type, priority, thread_id, mentions, read_by, project_path, created_at
        FROM messages
        WHERE channel_id = ANY($1) AND project_path = '/'
          AND created_at >= $8
          AND ($3::timestamptz IS NULL OR created_at > $3)
          AND ($4 = false OR ($5::text IS NOT NULL AND $5 = ANY(mentions)))
          AND ($6 = false OR ($5::text IS NOT NULL AND NOT ($5 = ANY(read_by))))
        ORDER BY created_at DESC
        LIMIT $7
        "#,
    )
    .bind(&channel_ids)
    .bind(store.project().path_str())
    .bind(query.since)
    .bind(query.mentions_only)
    .bind(agent_id.as_deref())
    .bind(query.unread_only)
    .bind(limit)
    .bind(session_start)
    .fetch_all(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    if let Some(agent_id) = &agent_id {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        if !ids.is_empty() {
            sqlx::query(
                "UPDATE messages SET read_by = array_append(read_by, $1) WHERE id = ANY($2) AND NOT ($1 = ANY(read_by))",
            )
            .bind(agent_id)
            .bind(&ids)
            .execute(&pool)
            .await
            .map_err(|e| SpecMemError::Storage(e.to_string()))?;
        }
    }

    let _ = query.compress; // no compression facility in this crate; see module doc.
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn broadcast_to_team(
    store: &CoordinationStore,
    sender_id: &str,
    content: &str,
    broadcast_type: BroadcastType,
    priority: MessagePriority,
    cross_project: bool,
) -> SpecMemResult<Message> {
    let pool = store.pool().await?;
    let channel_id = channels::resolve_channel(store, &pool, "broadcast", None, None).await?;
    let project_path = if cross_project { "/".to_string() } else { store.project().path_str().to_string() };
    let tagged = format!("[{}] {}", broadcast_type.as_str(), content);

    let row: MessageRow = sqlx::query_as(
        "INSERT INTO messages (channel_id, project_path, sender_id, sender_name, content, message_type, priority, mentions)
         VALUES ($1, $2, $3, $3, $4, $5, $6, '{}')
         RETURNING id, channel_id, sender_id, sender_name, content, message_type, priority, thread_id, mentions, read_by, project_path, created_at",
    )
    .bind(channel_id.as_str())
    .bind(project_path)
    .bind(sender_id)
    .bind(tagged)
    .bind(MessageType::Broadcast.as_str())
    .bind(priority.as_str())
    .fetch_one(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    channels::touch_activity(&pool, channel_id.as_str()).await?;

    store
        .bus()
        .post(Event::new(
            Topic::CoordinationBroadcast,
            sender_id,
            serde_json::json!({"broadcast_type": broadcast_type.as_str(), "cross_project": cross_project}),
        ))
        .fire_and_forget();

    Ok(row.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_are_lowercase_and_deduplicated_preserving_order() {
        let mentions = parse_mentions("@Alice please help, cc @bob and @alice again");
        assert_eq!(mentions, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn mentions_empty_when_absent() {
        assert!(parse_mentions("no mentions here").is_empty());
    }
}
