//! The per-project Coordination Bus: messaging, task claims, and help
//! requests, backed by the Postgres-compatible relational store
//! (spec.md §4.5).

pub mod channels;
pub mod claims;
pub mod help;
pub mod messages;

pub use claims::TaskClaim;
pub use help::HelpRequest;
pub use messages::{BroadcastType, Message, MessagePriority, MessageType, ReadMessagesQuery, SendMessageRequest};

use crate::db::PoolManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use specmem_core::bus::EventBus;
use specmem_core::error::{SpecMemError, SpecMemResult};
use specmem_core::project::ProjectContext;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TeamStatus {
    pub active_claims: Vec<TaskClaim>,
    pub recent_messages: Vec<Message>,
    pub open_help_requests: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ClearTeamMessagesOptions {
    pub confirm: bool,
    pub older_than_minutes: Option<i64>,
    pub clear_claims: bool,
    pub clear_help_requests: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClearStats {
    pub messages_deleted: u64,
    pub claims_deleted: u64,
    pub help_requests_deleted: u64,
}

/// Façade over messages/claims/help, all scoped to one project
/// (spec.md §4.5). Owns no in-memory state beyond the connection pool
/// it borrows from [`PoolManager`] and the session-start timestamp.
pub struct CoordinationStore {
    project: ProjectContext,
    pools: Arc<PoolManager>,
    bus: EventBus,
    /// A per-process wall-clock snapshot filtering pre-session messages
    /// out of reads. Local to this process — see §9's open design
    /// refinement about cross-process visibility.
    session_start: RwLock<DateTime<Utc>>,
}

impl CoordinationStore {
    pub async fn new(project: ProjectContext, pools: Arc<PoolManager>, bus: EventBus) -> SpecMemResult<Self> {
        pools
            .pool_for(project.path_str())
            .await
            .map_err(|e| SpecMemError::Storage(e.to_string()))?;
        Ok(Self {
            project,
            pools,
            bus,
            session_start: RwLock::new(Utc::now()),
        })
    }

    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn session_start(&self) -> DateTime<Utc> {
        *self.session_start.read().await
    }

    async fn reset_session_start(&self) {
        *self.session_start.write().await = Utc::now();
    }

    async fn pool(&self) -> SpecMemResult<PgPool> {
        self.pools
            .pool_for(self.project.path_str())
            .await
            .map_err(|e| SpecMemError::Storage(e.to_string()))
    }

    pub async fn send_message(&self, req: SendMessageRequest<'_>) -> SpecMemResult<Message> {
        messages::send_message(self, req).await
    }

    pub async fn read_messages(&self, query: ReadMessagesQuery) -> SpecMemResult<Vec<Message>> {
        messages::read_messages(self, query).await
    }

    pub async fn broadcast_to_team(
        &self,
        sender_id: &str,
        message: &str,
        broadcast_type: BroadcastType,
        priority: MessagePriority,
        cross_project: bool,
    ) -> SpecMemResult<Message> {
        messages::broadcast_to_team(self, sender_id, message, broadcast_type, priority, cross_project).await
    }

    pub async fn claim_task(&self, claimed_by: &str, description: &str, files: Vec<String>) -> SpecMemResult<TaskClaim> {
        claims::claim_task(self, claimed_by, description, files).await
    }

    pub async fn release_task(
        &self,
        claimed_by: &str,
        claim_id: &str,
        files: Option<Vec<String>>,
    ) -> SpecMemResult<()> {
        claims::release_task(self, claimed_by, claim_id, files).await
    }

    pub async fn request_help(
        &self,
        requested_by: &str,
        question: &str,
        context: Option<&str>,
        skills_needed: Vec<String>,
    ) -> SpecMemResult<HelpRequest> {
        help::request_help(self, requested_by, question, context, skills_needed).await
    }

    pub async fn respond_to_help(&self, responder_id: &str, request_id: &str, response: &str) -> SpecMemResult<()> {
        help::respond_to_help(self, responder_id, request_id, response).await
    }

    pub async fn get_team_status(&self) -> SpecMemResult<TeamStatus> {
        let pool = self.pool().await?;

        let claims: Vec<claims::ClaimRow> = sqlx::query_as(
            "SELECT id, project_path, description, files, claimed_by, status, claimed_at
             FROM task_claims WHERE project_path = $1 AND status = 'active'
             ORDER BY claimed_at DESC LIMIT 5",
        )
        .bind(self.project.path_str())
        .fetch_all(&pool)
        .await
        .map_err(|e| SpecMemError::Storage(e.to_string()))?;

        let recent: Vec<messages::MessageRow> = sqlx::query_as(
            "SELECT id, channel_id, sender_id, sender_name, content, message_type, priority, thread_id, mentions, read_by, project_path, created_at
             FROM messages WHERE project_path = $1 AND created_at >= $2
             ORDER BY created_at DESC LIMIT 3",
        )
        .bind(self.project.path_str())
        .bind(self.session_start().await)
        .fetch_all(&pool)
        .await
        .map_err(|e| SpecMemError::Storage(e.to_string()))?;

        let (open_help_requests,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM help_requests WHERE project_path = $1 AND status = 'open'",
        )
        .bind(self.project.path_str())
        .fetch_one(&pool)
        .await
        .map_err(|e| SpecMemError::Storage(e.to_string()))?;

        Ok(TeamStatus {
            active_claims: claims.into_iter().map(Into::into).collect(),
            recent_messages: recent.into_iter().map(Into::into).collect(),
            open_help_requests,
        })
    }

    pub async fn clear_team_messages(&self, opts: ClearTeamMessagesOptions) -> SpecMemResult<ClearStats> {
        if !opts.confirm {
            return Err(SpecMemError::InvalidInput(
                "clear_team_messages requires confirm=true".into(),
            ));
        }
        // Reset first: even a partially failed delete won't leave reads
        // seeing old content (spec.md §4.5).
        self.reset_session_start().await;

        let pool = self.pool().await?;
        let cutoff = opts
            .older_than_minutes
            .map(|m| Utc::now() - chrono::Duration::minutes(m));
        let mut stats = ClearStats::default();

        let result = sqlx::query(
            "DELETE FROM messages WHERE project_path = $1 AND ($2::timestamptz IS NULL OR created_at < $2)",
        )
        .bind(self.project.path_str())
        .bind(cutoff)
        .execute(&pool)
        .await
        .map_err(|e| SpecMemError::Storage(e.to_string()))?;
        stats.messages_deleted = result.rows_affected();

        if opts.clear_claims {
            let result = sqlx::query(
                "DELETE FROM task_claims WHERE project_path = $1 AND ($2::timestamptz IS NULL OR claimed_at < $2)",
            )
            .bind(self.project.path_str())
            .bind(cutoff)
            .execute(&pool)
            .await
            .map_err(|e| SpecMemError::Storage(e.to_string()))?;
            stats.claims_deleted = result.rows_affected();
        }

        if opts.clear_help_requests {
            let result = sqlx::query(
                "DELETE FROM help_requests WHERE project_path = $1 AND ($2::timestamptz IS NULL OR created_at < $2)",
            )
            .bind(self.project.path_str())
            .bind(cutoff)
            .execute(&pool)
            .await
            .map_err(|e| SpecMemError::Storage(e.to_string()))?;
            stats.help_requests_deleted = result.rows_affected();
        }

        Ok(stats)
    }
}
