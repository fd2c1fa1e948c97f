//! Task-claim operations (spec.md §4.5). Overlapping active claims on
//! the same file are a warning, never a rejection.

use super::messages::{MessagePriority, MessageType, SendMessageRequest};
use super::CoordinationStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use specmem_core::bus::{Event, Topic};
use specmem_core::error::{SpecMemError, SpecMemResult};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct TaskClaim {
    pub id: Uuid,
    pub project_path: String,
    pub description: String,
    pub files: Vec<String>,
    pub claimed_by: String,
    pub status: String,
    pub claimed_at: DateTime<Utc>,
    /// Overlap warnings for this call only (spec.md §8 scenario 3) —
    /// not persisted, since the overlap itself never blocks the claim.
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(sqlx::FromRow)]
pub(super) struct ClaimRow {
    pub id: Uuid,
    pub project_path: String,
    pub description: String,
    pub files: Vec<String>,
    pub claimed_by: String,
    pub status: String,
    pub claimed_at: DateTime<Utc>,
}

impl From<ClaimRow> for TaskClaim {
    fn from(r: ClaimRow) -> Self {
        TaskClaim {
            id: r.id,
            project_path: r.project_path,
            description: r.description,
            files: r.files,
            claimed_by: r.claimed_by,
            status: r.status,
            claimed_at: r.claimed_at,
            warnings: Vec::new(),
        }
    }
}

pub async fn claim_task(
    store: &CoordinationStore,
    claimed_by: &str,
    description: &str,
    files: Vec<String>,
) -> SpecMemResult<TaskClaim> {
    let pool = store.pool().await?;

    let mut warnings = Vec::new();
    if !files.is_empty() {
        let overlapping: Vec<(Uuid, String, Vec<String>)> = sqlx::query_as(
            "SELECT id, claimed_by, files FROM task_claims
             WHERE project_path = $1 AND status = 'active' AND claimed_by <> $2 AND files && $3",
        )
        .bind(store.project().path_str())
        .bind(claimed_by)
        .bind(&files)
        .fetch_all(&pool)
        .await
        .map_err(|e| SpecMemError::Storage(e.to_string()))?;

        for (other_id, other_claimed_by, other_files) in &overlapping {
            for file in files.iter().filter(|f| other_files.contains(f)) {
                warnings.push(format!(
                    "File \"{file}\" is already claimed by {other_claimed_by} (claim: {other_id})"
                ));
            }
        }
        if !warnings.is_empty() {
            tracing::warn!(
                claimed_by,
                files = ?files,
                warnings = ?warnings,
                "claim overlaps with active claims held by other agents"
            );
        }
    }

    let row: ClaimRow = sqlx::query_as(
        "INSERT INTO task_claims (project_path, description, files, claimed_by)
         VALUES ($1, $2, $3, $4)
         RETURNING id, project_path, description, files, claimed_by, status, claimed_at",
    )
    .bind(store.project().path_str())
    .bind(description)
    .bind(&files)
    .bind(claimed_by)
    .fetch_one(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    let mut claim: TaskClaim = row.into();
    claim.warnings = warnings;

    super::messages::send_message(
        store,
        SendMessageRequest {
            sender_id: claimed_by,
            sender_name: None,
            content: &format!("claimed: {description}"),
            message_type: MessageType::Status,
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
            Topic::CoordinationTaskClaimed,
            claimed_by,
            serde_json::json!({"claim_id": claim.id.to_string()}),
        ))
        .fire_and_forget();

    Ok(claim)
}

pub async fn release_task(
    store: &CoordinationStore,
    claimed_by: &str,
    claim_id: &str,
    files: Option<Vec<String>>,
) -> SpecMemResult<()> {
    let pool = store.pool().await?;

    if claim_id == "all" {
        sqlx::query(
            "UPDATE task_claims SET status = 'released', released_at = now()
             WHERE project_path = $1 AND claimed_by = $2 AND status = 'active'",
        )
        .bind(store.project().path_str())
        .bind(claimed_by)
        .execute(&pool)
        .await
        .map_err(|e| SpecMemError::Storage(e.to_string()))?;
        announce_release(store, claimed_by, "all active claims").await?;
        return Ok(());
    }

    let claim_uuid =
        Uuid::parse_str(claim_id).map_err(|_| SpecMemError::InvalidInput("invalid claim id".into()))?;

    let row: Option<ClaimRow> = sqlx::query_as(
        "SELECT id, project_path, description, files, claimed_by, status, claimed_at
         FROM task_claims WHERE id = $1 AND project_path = $2",
    )
    .bind(claim_uuid)
    .bind(store.project().path_str())
    .fetch_optional(&pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;

    let Some(row) = row else {
        return Err(SpecMemError::NotFound(format!("claim {claim_id} not found")));
    };
    if row.claimed_by != claimed_by {
        return Err(SpecMemError::Forbidden("claim belongs to a different agent".into()));
    }
    if row.status != "active" {
        return Err(SpecMemError::AlreadyReleased(claim_id.to_string()));
    }

    match files {
        Some(to_remove) if !to_remove.is_empty() => {
            let remaining: Vec<String> = row.files.iter().filter(|f| !to_remove.contains(f)).cloned().collect();
            if remaining.is_empty() {
                sqlx::query("UPDATE task_claims SET status = 'released', released_at = now() WHERE id = $1")
                    .bind(claim_uuid)
                    .execute(&pool)
                    .await
                    .map_err(|e| SpecMemError::Storage(e.to_string()))?;
            } else {
                sqlx::query("UPDATE task_claims SET files = $2 WHERE id = $1")
                    .bind(claim_uuid)
                    .bind(&remaining)
                    .execute(&pool)
                    .await
                    .map_err(|e| SpecMemError::Storage(e.to_string()))?;
            }
        }
        _ => {
            sqlx::query("UPDATE task_claims SET status = 'released', released_at = now() WHERE id = $1")
                .bind(claim_uuid)
                .execute(&pool)
                .await
                .map_err(|e| SpecMemError::Storage(e.to_string()))?;
        }
    }

    announce_release(store, claimed_by, &row.description).await?;

    store
        .bus()
        .post(Event::new(
            Topic::CoordinationTaskReleased,
            claimed_by,
            serde_json::json!({"claim_id": claim_id}),
        ))
        .fire_and_forget();

    Ok(())
}

async fn announce_release(store: &CoordinationStore, claimed_by: &str, what: &str) -> SpecMemResult<()> {
    super::messages::send_message(
        store,
        SendMessageRequest {
            sender_id: claimed_by,
            sender_name: None,
            content: &format!("released: {what}"),
            message_type: MessageType::Status,
            priority: MessagePriority::Normal,
            channel: "main",
            task_id: None,
            project_id: None,
            thread_id: None,
        },
    )
    .await
    .map(|_| ())
}
