//! Help-request operations (spec.md §4.5).

use super::messages::{MessagePriority, MessageType, SendMessageRequest};
use super::CoordinationStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use specmem_core::bus::{Event, Topic};
use specmem_core::error::{SpecMemError, SpecMemResult};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct HelpRequest {
    pub id: Uuid,
    pub project_path: String,
    pub requested_by: String,
    pub question: String,
    pub context: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct HelpRow {
    id: Uuid,
    project_path: String,
    requested_by: String,
    question: String,
    context: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}

impl From<HelpRow> for HelpRequest {
    fn from(r: HelpRow) -> Self {
        HelpRequest {
            id: r.id,
            project_path: r.project_path,
            requested_by: r.requested_by,
            question: r.question,
            context: r.context,
            status: r.status,
            created_at: r.created_at,
        }
    }
}

pub async fn request_help(
    store: &CoordinationStore,
    requested_by: &str,
    question: &str,
    context: Option<&str>,
    skills_needed: Vec<String>,
) -> SpecMemResult<HelpRequest> {
    if question.trim().is_empty() {
        return Err(SpecMemError::InvalidInput("help question must not be empty".into()));
    }

    let pool = store.pool().await?;
    let row: HelpRow = sqlx::query_as(
        "INSERT INTO help_requests (project_path, requested_by, question, context)
         VALUES ($1, $2, $3, $4)
         RETURNING id, project_path, requested_by, question, context, status, created_at",
    )
    .bind(store.project().path_str())
    .bind(requested_by)
    .bind(question)
    .bind(context)
    .fetch_one(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    let help: HelpRequest = row.into();

    let skills_suffix = if skills_needed.is_empty() {
        String::new()
    } else {
        format!(" (skills: {})", skills_needed.join(", "))
    };

    super::messages::send_message(
        store,
        SendMessageRequest {
            sender_id: requested_by,
            sender_name: None,
            content: &format!("help requested [{}]: {}{}", help.id, question, skills_suffix),
            message_type: MessageType::HelpRequest,
            priority: MessagePriority::High,
            channel: "broadcast",
            task_id: None,
            project_id: None,
            thread_id: None,
        },
    )
    .await?;

    store
        .bus()
        .post(Event::new(
            Topic::CoordinationHelpRequested,
            requested_by,
            serde_json::json!({"request_id": help.id.to_string()}),
        ))
        .fire_and_forget();

    Ok(help)
}

pub async fn respond_to_help(
    store: &CoordinationStore,
    responder_id: &str,
    request_id: &str,
    response: &str,
) -> SpecMemResult<()> {
    let pool = store.pool().await?;
    let request_uuid =
        Uuid::parse_str(request_id).map_err(|_| SpecMemError::InvalidInput("invalid help request id".into()))?;

    let row: Option<HelpRow> = sqlx::query_as(
        "SELECT id, project_path, requested_by, question, context, status, created_at
         FROM help_requests WHERE id = $1 AND project_path = $2",
    )
    .bind(request_uuid)
    .bind(store.project().path_str())
    .fetch_optional(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    let Some(row) = row else {
        return Err(SpecMemError::NotFound(format!("help request {request_id} not found")));
    };

    sqlx::query(
        "UPDATE help_requests SET status = 'answered', resolved_at = now(), response = $2
         WHERE id = $1 AND status = 'open'",
    )
    .bind(request_uuid)
    .bind(response)
    .execute(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    super::messages::send_message(
        store,
        SendMessageRequest {
            sender_id: responder_id,
            sender_name: None,
            content: &format!("help response [{request_id}]: {response}"),
            message_type: MessageType::HelpResponse,
            priority: MessagePriority::High,
            channel: "main",
            task_id: None,
            project_id: None,
            thread_id: None,
        },
    )
    .await?;

    super::messages::send_message(
        store,
        SendMessageRequest {
            sender_id: responder_id,
            sender_name: None,
            content: &format!("@{} your help request has a response: {}", row.requested_by, response),
            message_type: MessageType::HelpResponse,
            priority: MessagePriority::Normal,
            channel: "main",
            task_id: None,
            project_id: None,
            thread_id: None,
        },
    )
    .await?;

    store
        .bus()
        .post(Event::new(
            Topic::CoordinationHelpAnswered,
            responder_id,
            serde_json::json!({"request_id": request_id}),
        ))
        .fire_and_forget();

    Ok(())
}
