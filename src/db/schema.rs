//! Idempotent per-project schema bootstrap: creates the schema and its
//! four tables (`memories`, `channels`, `messages`, `task_claims`,
//! `help_requests`) the first time a project is seen, and provisions
//! the default channel set (spec.md §4.1, §6).
//!
//! Bootstrap is memoized process-wide so a busy project doesn't pay the
//! `CREATE ... IF NOT EXISTS` round trips on every pool checkout.

use dashmap::DashSet;
use sqlx::postgres::PgPool;
use sqlx::Executor;
use std::sync::OnceLock;

static BOOTSTRAPPED: OnceLock<DashSet<String>> = OnceLock::new();

fn bootstrapped() -> &'static DashSet<String> {
    BOOTSTRAPPED.get_or_init(DashSet::new)
}

pub async fn bootstrap(pool: &PgPool, schema_name: &str, project_path: &str) -> anyhow::Result<()> {
    if bootstrapped().contains(schema_name) {
        return Ok(());
    }
    create_schema(pool, schema_name).await?;
    create_tables(pool).await?;
    create_indexes(pool).await?;
    provision_default_channels(pool, project_path).await?;
    bootstrapped().insert(schema_name.to_string());
    Ok(())
}

async fn create_schema(pool: &PgPool, schema_name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        super::is_safe_identifier(schema_name),
        "refusing to bootstrap unsafe schema name: {schema_name}"
    );
    pool.execute(format!("CREATE SCHEMA IF NOT EXISTS {schema_name}").as_str())
        .await?;
    pool.execute("CREATE EXTENSION IF NOT EXISTS vector").await.ok();
    pool.execute("CREATE EXTENSION IF NOT EXISTS pgcrypto").await.ok();
    Ok(())
}

async fn create_tables(pool: &PgPool) -> anyhow::Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            project_path TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            entry_hash TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            tags TEXT[] NOT NULL DEFAULT '{}',
            metadata JSONB NOT NULL DEFAULT '{}',
            embedding vector(1536),
            session_id TEXT,
            source_path TEXT,
            occurred_at TIMESTAMPTZ NOT NULL,
            ingested_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .await?;
    pool.execute(
        "ALTER TABLE memories ADD COLUMN IF NOT EXISTS entry_hash TEXT NOT NULL DEFAULT ''",
    )
    .await
    .ok();

    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'standard',
            project_path TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_activity_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .await?;

    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            channel_id TEXT NOT NULL REFERENCES channels(id),
            project_path TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            content TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT 'text',
            priority TEXT NOT NULL DEFAULT 'normal',
            thread_id UUID,
            mentions TEXT[] NOT NULL DEFAULT '{}',
            read_by TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .await?;

    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_claims (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            project_path TEXT NOT NULL,
            description TEXT NOT NULL,
            files TEXT[] NOT NULL DEFAULT '{}',
            claimed_by TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            claimed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            released_at TIMESTAMPTZ
        )
        "#,
    )
    .await?;

    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS help_requests (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            project_path TEXT NOT NULL,
            requested_by TEXT NOT NULL,
            question TEXT NOT NULL,
            context TEXT,
            status TEXT NOT NULL DEFAULT 'open',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            resolved_at TIMESTAMPTZ,
            response TEXT
        )
        "#,
    )
    .await?;

    Ok(())
}

async fn create_indexes(pool: &PgPool) -> anyhow::Result<()> {
    pool.execute("CREATE INDEX IF NOT EXISTS memories_project_path_idx ON memories (project_path)")
        .await?;
    // Deliberately non-unique: dedup is an application-level, pre-insert
    // concern (spec.md §3), never enforced at the database layer. This
    // index only accelerates the bulk existing-hash fetch.
    pool.execute(
        "CREATE INDEX IF NOT EXISTS memories_entry_hash_idx ON memories (project_path, entry_hash)",
    )
    .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS memories_occurred_at_idx ON memories (occurred_at DESC)")
        .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS memories_tags_gin_idx ON memories USING gin (tags)")
        .await?;

    pool.execute("CREATE INDEX IF NOT EXISTS messages_channel_id_idx ON messages (channel_id)")
        .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS messages_sender_id_idx ON messages (sender_id)")
        .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS messages_project_path_idx ON messages (project_path)")
        .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS messages_created_at_idx ON messages (created_at DESC)")
        .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS messages_thread_id_idx ON messages (thread_id)")
        .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS messages_mentions_gin_idx ON messages USING gin (mentions)")
        .await?;

    pool.execute(
        "CREATE INDEX IF NOT EXISTS task_claims_active_idx ON task_claims (project_path) WHERE status = 'active'",
    )
    .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS task_claims_files_gin_idx ON task_claims USING gin (files)")
        .await?;

    pool.execute(
        "CREATE INDEX IF NOT EXISTS help_requests_open_idx ON help_requests (project_path) WHERE status = 'open'",
    )
    .await?;

    Ok(())
}

async fn provision_default_channels(pool: &PgPool, project_path: &str) -> anyhow::Result<()> {
    for name in specmem_core::project::DEFAULT_CHANNELS {
        let id = specmem_core::ids::ChannelId::derive(project_path, name);
        let kind = if *name == "broadcast" { "broadcast" } else { "standard" };
        sqlx::query(
            "INSERT INTO channels (id, name, kind, project_path) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(*name)
        .bind(kind)
        .bind(project_path)
        .execute(pool)
        .await?;
    }
    Ok(())
}
