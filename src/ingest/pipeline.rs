//! Orchestrates discovery, parsing, deduplication, embedding, and
//! insertion into one `SessionIngestor` (spec.md §4.4).

use crate::config::Settings;
use crate::db::PoolManager;
use crate::embedding::EmbeddingClient;
use crate::ingest::discovery::{discover, discover_since, DiscoveredFile};
use crate::ingest::parser::{parse_line, ParseLineError, SessionEntry};
use dashmap::DashMap;
use serde::Serialize;
use specmem_core::bus::{Event, EventBus, Topic};
use specmem_core::project::ProjectContext;
use sqlx::postgres::PgPool;
use sqlx::QueryBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

/// Per-run outcome counters, returned from every ingestion entry point
/// (spec.md §7).
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub parse_errors: usize,
    pub ack_success: usize,
    pub ack_failed: usize,
}

impl IngestStats {
    fn add(&mut self, other: &IngestStats) {
        self.total += other.total;
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.parse_errors += other.parse_errors;
        self.ack_success += other.ack_success;
        self.ack_failed += other.ack_failed;
    }
}

#[derive(sqlx::FromRow)]
struct InsertedRow {
    entry_hash: String,
}

pub struct SessionIngestor {
    project: ProjectContext,
    pools: Arc<PoolManager>,
    embeddings: Arc<EmbeddingClient>,
    bus: EventBus,
    settings: Settings,
    source_root: PathBuf,
    /// Per-file parse error counter. The ingestor owns no other
    /// long-lived state besides this and mtime memoization handled by
    /// `discovery::discover_since` (spec.md §3 ownership note).
    parse_error_counts: DashMap<PathBuf, u64>,
}

impl SessionIngestor {
    pub fn new(
        project: ProjectContext,
        pools: Arc<PoolManager>,
        embeddings: Arc<EmbeddingClient>,
        bus: EventBus,
        settings: Settings,
        source_root: PathBuf,
    ) -> Self {
        Self {
            project,
            pools,
            embeddings,
            bus,
            settings,
            source_root,
            parse_error_counts: DashMap::new(),
        }
    }

    /// Full newest-first catch-up pass over every discoverable file.
    pub async fn catch_up(&self) -> anyhow::Result<IngestStats> {
        let files = discover(&self.source_root, None)?;
        self.ingest_files(files, None).await
    }

    /// Incremental pass: only files modified since `since_ms`, and only
    /// entries whose own timestamp exceeds it (spec.md §4.4).
    pub async fn parse_new_entries(&self, since_ms: i64) -> anyhow::Result<IngestStats> {
        let since = UNIX_EPOCH + Duration::from_millis(since_ms.max(0) as u64);
        let files = discover_since(&self.source_root, None, since)?;
        self.ingest_files(files, Some(since_ms)).await
    }

    async fn ingest_files(
        &self,
        files: Vec<DiscoveredFile>,
        since_ms: Option<i64>,
    ) -> anyhow::Result<IngestStats> {
        let pool = self.pools.pool_for(self.project.path_str()).await?;
        let mut existing_hashes = self.fetch_existing_hashes(&pool).await?;
        let mut stats = IngestStats::default();

        for file in files {
            let file_stats = self
                .ingest_file(&pool, &file.path, &mut existing_hashes, since_ms)
                .await?;
            stats.add(&file_stats);
        }

        self.bus
            .post(Event::new(
                Topic::IngestBatchComplete,
                "session-ingestor",
                serde_json::to_value(&stats).unwrap_or_default(),
            ))
            .fire_and_forget();

        Ok(stats)
    }

    async fn fetch_existing_hashes(&self, pool: &PgPool) -> anyhow::Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT entry_hash FROM memories WHERE project_path = $1 AND 'claude-session' = ANY(tags)",
        )
        .bind(self.project.path_str())
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(h,)| h).collect())
    }

    async fn ingest_file(
        &self,
        pool: &PgPool,
        path: &Path,
        existing_hashes: &mut HashSet<String>,
        since_ms: Option<i64>,
    ) -> anyhow::Result<IngestStats> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "could not read session file, skipping");
                return Ok(IngestStats::default());
            }
        };

        // Newest-first within a file too: lines are appended in
        // chronological order, so the file is processed in reverse.
        let mut lines: Vec<&str> = content.lines().collect();
        lines.reverse();
        let total_lines = lines.len();

        let mut stats = IngestStats::default();
        let mut consecutive_duplicates = 0usize;
        let mut batch: Vec<SessionEntry> = Vec::new();
        let mut batch_bytes = 0usize;
        let batch_start = Instant::now();

        for (line_no, line) in lines.iter().enumerate() {
            stats.total += 1;
            if line.trim().is_empty() {
                continue;
            }

            let entry = match parse_line(line, path) {
                Ok(None) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    stats.parse_errors += 1;
                    self.log_parse_error(path, line_no, line, &e);
                    continue;
                }
                Ok(Some(entry)) => entry,
            };

            if !self.project.scopes(&entry.project) {
                stats.skipped += 1;
                continue;
            }
            if let Some(since) = since_ms {
                if entry.timestamp.timestamp_millis() <= since {
                    stats.skipped += 1;
                    continue;
                }
            }
            if existing_hashes.contains(&entry.entry_hash) {
                stats.skipped += 1;
                consecutive_duplicates += 1;
                if consecutive_duplicates >= self.settings.ingest_early_exit_threshold {
                    tracing::debug!(
                        file = %path.display(),
                        "early exit after {} consecutive already-indexed entries",
                        consecutive_duplicates
                    );
                    break;
                }
                continue;
            }
            consecutive_duplicates = 0;

            batch_bytes += line.len();
            batch.push(entry);

            if batch.len() >= self.settings.ingest_batch_size {
                let flushed = self
                    .flush_batch(pool, path, std::mem::take(&mut batch), existing_hashes)
                    .await?;
                stats.add(&flushed);
                self.throttle(batch_start, batch_bytes).await;
                batch_bytes = 0;
            }
        }

        if !batch.is_empty() {
            let flushed = self.flush_batch(pool, path, batch, existing_hashes).await?;
            stats.add(&flushed);
        }

        self.maybe_log_parse_error_summary(path, total_lines);
        Ok(stats)
    }

    /// Embeds and inserts one batch. Embedding failures degrade to the
    /// deterministic fallback inside `EmbeddingClient::embed` rather
    /// than failing the batch; insert failures are isolated per row via
    /// the `RETURNING entry_hash` set difference (spec.md §4.4).
    async fn flush_batch(
        &self,
        pool: &PgPool,
        source_path: &Path,
        entries: Vec<SessionEntry>,
        existing_hashes: &mut HashSet<String>,
    ) -> anyhow::Result<IngestStats> {
        let mut stats = IngestStats::default();
        if entries.is_empty() {
            return Ok(stats);
        }

        let mut join_set = tokio::task::JoinSet::new();
        for (idx, entry) in entries.iter().enumerate() {
            let client = self.embeddings.clone();
            let text = entry.formatted_content();
            join_set.spawn(async move { (idx, client.embed(&text).await) });
        }
        let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; entries.len()];
        while let Some(result) = join_set.join_next().await {
            if let Ok((idx, vector)) = result {
                embeddings[idx] = Some(vector);
            }
        }

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO memories (project_path, role, content, entry_hash, content_hash, tags, metadata, embedding, session_id, source_path, occurred_at) ",
        );

        let mut rows_bound = 0usize;
        builder.push_values(
            entries.iter().zip(embeddings.iter()).filter_map(|(e, v)| v.as_ref().map(|v| (e, v))),
            |mut b, (entry, embedding)| {
                rows_bound += 1;
                let role_str = match entry.role {
                    crate::ingest::parser::Role::User => "user",
                    crate::ingest::parser::Role::Assistant => "assistant",
                };
                let metadata = serde_json::json!({
                    "session_id": entry.session_id,
                    "timestamp": entry.timestamp.to_rfc3339(),
                    "timestamp_ms": entry.timestamp.timestamp_millis(),
                    "role": role_str,
                    "message_id": entry.message_id,
                    "hash": entry.entry_hash,
                });
                b.push_bind(self.project.path_str())
                    .push_bind(role_str)
                    .push_bind(entry.formatted_content())
                    .push_bind(entry.entry_hash.clone())
                    .push_bind(entry.content_hash.clone())
                    .push_bind(vec![entry.tag().to_string(), "claude-session".to_string()])
                    .push_bind(metadata)
                    .push_bind(pgvector::Vector::from(embedding.clone()))
                    .push_bind(entry.session_id.clone())
                    .push_bind(source_path.display().to_string())
                    .push_bind(entry.timestamp);
            },
        );

        if rows_bound == 0 {
            stats.ack_failed += entries.len();
            return Ok(stats);
        }
        builder.push(" RETURNING entry_hash");

        let mut tx = pool.begin().await?;
        let inserted: Vec<InsertedRow> = builder.build_query_as().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let inserted_hashes: HashSet<String> = inserted.into_iter().map(|r| r.entry_hash).collect();
        for entry in &entries {
            if inserted_hashes.contains(&entry.entry_hash) {
                stats.processed += 1;
                stats.ack_success += 1;
                existing_hashes.insert(entry.entry_hash.clone());
            } else {
                stats.ack_failed += 1;
                tracing::warn!(entry_hash = %entry.entry_hash, "insert did not acknowledge this entry");
            }
        }
        Ok(stats)
    }

    async fn throttle(&self, batch_start: Instant, bytes_processed: usize) {
        let elapsed = batch_start.elapsed();
        let expected = Duration::from_secs_f64(
            bytes_processed as f64 / self.settings.ingest_throughput_bytes_per_sec as f64,
        );
        if elapsed < expected {
            tokio::time::sleep(self.settings.ingest_chunk_delay()).await;
        }
    }

    fn log_parse_error(&self, path: &Path, line_no: usize, line: &str, err: &ParseLineError) {
        let mut count = self.parse_error_counts.entry(path.to_path_buf()).or_insert(0);
        *count += 1;
        if *count <= 5 {
            let truncated: String = line.chars().take(120).collect();
            tracing::warn!(
                file = %path.display(),
                line = line_no,
                error = %err,
                content = %truncated,
                "session line failed to parse"
            );
        }
    }

    fn maybe_log_parse_error_summary(&self, path: &Path, total_lines: usize) {
        if total_lines == 0 {
            return;
        }
        if let Some(count) = self.parse_error_counts.get(path) {
            let ratio = *count as f64 / total_lines as f64;
            if ratio > 0.1 {
                tracing::warn!(
                    file = %path.display(),
                    parse_errors = *count,
                    total_lines,
                    "more than 10% of lines in this file failed to parse"
                );
            }
        }
    }
}

