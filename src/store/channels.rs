//! Channel resolution and the best-effort, file-based channel
//! assignment check that backs `send_message`'s enforcement rule
//! (spec.md §4.5).

use super::CoordinationStore;
use serde_json::Value;
use specmem_core::error::{SpecMemError, SpecMemResult};
use specmem_core::ids::ChannelId;
use specmem_core::project::ProjectContext;
use sqlx::postgres::PgPool;
use std::time::{Duration, SystemTime};

const ASSIGNMENT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Default,
    Broadcast,
    Task,
    Project,
    Direct,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Default => "default",
            ChannelKind::Broadcast => "broadcast",
            ChannelKind::Task => "task",
            ChannelKind::Project => "project",
            ChannelKind::Direct => "direct",
        }
    }
}

/// Resolves a requested channel name (or a `task_id`/`project_id`
/// override) to a stable channel id, upserting task/project channels
/// on demand (spec.md §4.5).
pub async fn resolve_channel(
    store: &CoordinationStore,
    pool: &PgPool,
    requested: &str,
    task_id: Option<&str>,
    project_id: Option<&str>,
) -> SpecMemResult<ChannelId> {
    if let Some(task_id) = task_id {
        return upsert_channel(store, pool, &format!("task-{task_id}"), ChannelKind::Task).await;
    }
    if let Some(project_id) = project_id {
        return upsert_channel(store, pool, &format!("project-{project_id}"), ChannelKind::Project).await;
    }

    let name = match requested {
        "main" | "default" => "main",
        "broadcast" => "broadcast",
        "swarm-1" | "swarm-2" | "swarm-3" | "swarm-4" | "swarm-5" => requested,
        _ => "main",
    };
    Ok(store.project().channel_id(name))
}

async fn upsert_channel(
    store: &CoordinationStore,
    pool: &PgPool,
    name: &str,
    kind: ChannelKind,
) -> SpecMemResult<ChannelId> {
    let id = store.project().channel_id(name);
    sqlx::query(
        "INSERT INTO channels (id, name, kind, project_path) VALUES ($1, $2, $3, $4)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(id.as_str())
    .bind(name)
    .bind(kind.as_str())
    .bind(store.project().path_str())
    .execute(pool)
    .await
    .map_err(|e| SpecMemError::Storage(e.to_string()))?;
    Ok(id)
}

pub async fn touch_activity(pool: &PgPool, channel_id: &str) -> SpecMemResult<()> {
    sqlx::query("UPDATE channels SET last_activity_at = now() WHERE id = $1")
        .bind(channel_id)
        .execute(pool)
        .await
        .map_err(|e| SpecMemError::Storage(e.to_string()))?;
    Ok(())
}

/// Reads `<agent-channels-dir>/<agent_id>.json`. A missing file, or one
/// older than 5 minutes, means enforcement is permissive (spec.md §6) —
/// this is deliberately best-effort and never surfaces an I/O error to
/// the caller.
pub fn read_channel_assignment(project: &ProjectContext, agent_id: &str) -> Option<String> {
    let path = project.agent_channels_dir().join(format!("{agent_id}.json"));
    let metadata = std::fs::metadata(&path).ok()?;
    let modified = metadata.modified().ok()?;
    if SystemTime::now().duration_since(modified).unwrap_or_default() > ASSIGNMENT_MAX_AGE {
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&content).ok()?;
    value.get("channel").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn missing_assignment_file_is_permissive() {
        let dir = TempDir::new().unwrap();
        let project = ProjectContext::for_path(dir.path()).unwrap();
        assert!(read_channel_assignment(&project, "agent-1").is_none());
    }

    #[test]
    fn reads_assigned_channel_from_file() {
        let dir = TempDir::new().unwrap();
        let project = ProjectContext::for_path(dir.path()).unwrap();
        let channels_dir = project.agent_channels_dir();
        fs::create_dir_all(&channels_dir).unwrap();
        fs::write(
            channels_dir.join("agent-1.json"),
            serde_json::json!({"channel": "swarm-2"}).to_string(),
        )
        .unwrap();

        assert_eq!(
            read_channel_assignment(&project, "agent-1").as_deref(),
            Some("swarm-2")
        );
    }

    #[test]
    fn stale_assignment_file_is_permissive() {
        let dir = TempDir::new().unwrap();
        let project = ProjectContext::for_path(dir.path()).unwrap();
        let channels_dir = project.agent_channels_dir();
        fs::create_dir_all(&channels_dir).unwrap();
        let path = channels_dir.join("agent-1.json");
        fs::write(&path, serde_json::json!({"channel": "swarm-2"}).to_string()).unwrap();

        let stale = SystemTime::now() - Duration::from_secs(6 * 60);
        let file = fs::File::open(&path).unwrap();
        file.set_modified(stale).unwrap();

        assert!(read_channel_assignment(&project, "agent-1").is_none());
    }
}
