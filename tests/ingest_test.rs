//! End-to-end scenarios for the Session Ingestion Pipeline (spec.md
//! §8). Gated on a reachable Postgres instance, same convention as
//! `tests/coordination_test.rs`.

use specmem::{EmbeddingClient, PoolManager, Settings};
use specmem::ingest::SessionIngestor;
use specmem_core::bus::EventBus;
use specmem_core::project::ProjectContext;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn test_database_url() -> Option<String> {
    std::env::var("SPECMEM_TEST_DATABASE_URL").ok()
}

fn write_history(source_root: &std::path::Path, lines: &[serde_json::Value]) {
    fs::create_dir_all(source_root).expect("create source root");
    let body = lines
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(source_root.join("history.jsonl"), body).expect("write history.jsonl");
}

fn session_line(cwd: &str, session_id: &str, timestamp_ms: i64, text: &str) -> serde_json::Value {
    serde_json::json!({
        "sessionId": session_id,
        "cwd": cwd,
        "message": {"role": "user", "content": text},
        "timestamp": timestamp_ms as f64,
    })
}

async fn new_ingestor(project: ProjectContext, source_root: &std::path::Path) -> SessionIngestor {
    let pools = PoolManager::new(test_database_url().expect("database url checked by caller"));
    // No sidecar socket exists at this path, so every embedding call
    // degrades to the deterministic fallback (spec.md §8 scenario 6).
    let embeddings = Arc::new(EmbeddingClient::new(
        project.socket_path(),
        std::time::Duration::from_millis(200),
        16,
    ));
    SessionIngestor::new(
        project,
        pools,
        embeddings,
        EventBus::new(),
        Settings::default(),
        source_root.to_path_buf(),
    )
}

#[tokio::test]
#[ignore = "requires SPECMEM_TEST_DATABASE_URL"]
async fn dedup_across_two_projects_does_not_cross_contaminate() {
    if test_database_url().is_none() {
        eprintln!("skipping: SPECMEM_TEST_DATABASE_URL not set");
        return;
    }

    let source = TempDir::new().expect("source root");
    let project_a_dir = TempDir::new().expect("project a dir");
    let project_b_dir = TempDir::new().expect("project b dir");

    write_history(
        source.path(),
        &[session_line(
            project_a_dir.path().to_str().unwrap(),
            "s1",
            1_700_000_000_000,
            "hello from project a",
        )],
    );

    let project_a = ProjectContext::for_path(project_a_dir.path()).unwrap();
    let project_b = ProjectContext::for_path(project_b_dir.path()).unwrap();

    let ingestor_a = new_ingestor(project_a, source.path()).await;
    let stats_a = ingestor_a.catch_up().await.expect("ingest into project a");
    assert_eq!(stats_a.ack_success, 1);

    let ingestor_b = new_ingestor(project_b, source.path()).await;
    let stats_b = ingestor_b.catch_up().await.expect("ingest into project b");
    assert_eq!(stats_b.ack_success, 0);
    assert_eq!(stats_b.skipped, 1);
}

#[tokio::test]
#[ignore = "requires SPECMEM_TEST_DATABASE_URL"]
async fn repeated_catch_up_is_idempotent() {
    if test_database_url().is_none() {
        eprintln!("skipping: SPECMEM_TEST_DATABASE_URL not set");
        return;
    }

    let source = TempDir::new().expect("source root");
    let project_dir = TempDir::new().expect("project dir");
    write_history(
        source.path(),
        &[session_line(
            project_dir.path().to_str().unwrap(),
            "s1",
            1_700_000_000_000,
            "idempotent ingestion check",
        )],
    );

    let project = ProjectContext::for_path(project_dir.path()).unwrap();
    let ingestor = new_ingestor(project, source.path()).await;

    let first = ingestor.catch_up().await.expect("first catch_up");
    assert_eq!(first.ack_success, 1);

    let second = ingestor.catch_up().await.expect("second catch_up");
    assert_eq!(second.ack_success, 0);
    assert_eq!(second.skipped, 1);
}

#[tokio::test]
#[ignore = "requires SPECMEM_TEST_DATABASE_URL"]
async fn embedding_sidecar_down_falls_back_without_failing_the_batch() {
    if test_database_url().is_none() {
        eprintln!("skipping: SPECMEM_TEST_DATABASE_URL not set");
        return;
    }

    let source = TempDir::new().expect("source root");
    let project_dir = TempDir::new().expect("project dir");
    let lines: Vec<serde_json::Value> = (0..10)
        .map(|i| {
            session_line(
                project_dir.path().to_str().unwrap(),
                "s1",
                1_700_000_000_000 + i,
                &format!("entry number {i}"),
            )
        })
        .collect();
    write_history(source.path(), &lines);

    let project = ProjectContext::for_path(project_dir.path()).unwrap();
    let ingestor = new_ingestor(project, source.path()).await;

    let stats = ingestor.catch_up().await.expect("catch_up with no sidecar running");
    assert_eq!(stats.ack_success, 10);
    assert_eq!(stats.ack_failed, 0);
}

#[tokio::test]
#[ignore = "requires SPECMEM_TEST_DATABASE_URL"]
async fn incremental_pass_since_now_returns_no_entries() {
    if test_database_url().is_none() {
        eprintln!("skipping: SPECMEM_TEST_DATABASE_URL not set");
        return;
    }

    let source = TempDir::new().expect("source root");
    let project_dir = TempDir::new().expect("project dir");
    write_history(
        source.path(),
        &[session_line(
            project_dir.path().to_str().unwrap(),
            "s1",
            1_700_000_000_000,
            "an entry in the past",
        )],
    );

    let project = ProjectContext::for_path(project_dir.path()).unwrap();
    let ingestor = new_ingestor(project, source.path()).await;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let stats = ingestor
        .parse_new_entries(now_ms)
        .await
        .expect("incremental pass since now");
    assert_eq!(stats.ack_success, 0);
}
