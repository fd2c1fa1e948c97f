//! Debounced file-system watcher driving incremental ingestion
//! (spec.md §4.4): three cooperative loops (initial catch-up, a
//! debounced change notifier, and a periodic heartbeat) coordinated so
//! none of them re-triggers a pass the others already covered.

use crate::ingest::pipeline::SessionIngestor;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Runs watch + heartbeat loops against `ingestor` until the returned
/// handle is dropped or `stop()` is called.
pub struct SessionWatcher {
    stop_tx: mpsc::Sender<()>,
    last_event_unix_ms: Arc<AtomicI64>,
}

impl SessionWatcher {
    /// Spawns the watcher. `source_root` is watched recursively;
    /// `since_ms` seeds the first incremental pass after catch-up.
    pub fn spawn(
        ingestor: Arc<SessionIngestor>,
        source_root: impl AsRef<Path>,
        debounce: Duration,
        heartbeat_interval: Duration,
        startup_grace: Duration,
    ) -> anyhow::Result<Self> {
        let source_root = source_root.as_ref().to_path_buf();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (fs_tx, mut fs_rx) = mpsc::channel::<()>(64);
        let last_event_unix_ms = Arc::new(AtomicI64::new(now_unix_ms()));

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = fs_tx.try_send(());
            }
        })?;
        watcher.watch(&source_root, RecursiveMode::Recursive)?;

        let last_event_for_debounce = last_event_unix_ms.clone();
        let watch_ingestor = ingestor.clone();
        tokio::spawn(async move {
            // Keep the watcher alive for the life of this task.
            let _watcher = watcher;
            let since = Arc::new(AtomicI64::new(now_unix_ms()));
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => break,
                    maybe_event = fs_rx.recv() => {
                        if maybe_event.is_none() {
                            break;
                        }
                        // Debounce: drain anything else that arrives within the window.
                        tokio::time::sleep(debounce).await;
                        while fs_rx.try_recv().is_ok() {}
                        last_event_for_debounce.store(now_unix_ms(), Ordering::SeqCst);
                        run_incremental_pass(&watch_ingestor, &since).await;
                    }
                }
            }
        });

        let heartbeat_ingestor = ingestor;
        let heartbeat_since = Arc::new(AtomicI64::new(now_unix_ms()));
        let heartbeat_last_event = last_event_unix_ms.clone();
        let startup_at = tokio::time::Instant::now() + startup_grace;
        tokio::spawn(async move {
            tokio::time::sleep_until(startup_at).await;
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let idle_for = now_unix_ms() - heartbeat_last_event.load(Ordering::SeqCst);
                if idle_for > Duration::from_secs(5 * 60).as_millis() as i64 {
                    tracing::warn!(idle_ms = idle_for, "session watcher has seen no file events recently");
                }
                run_incremental_pass(&heartbeat_ingestor, &heartbeat_since).await;
            }
        });

        Ok(Self {
            stop_tx,
            last_event_unix_ms,
        })
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }

    pub fn last_event_unix_ms(&self) -> i64 {
        self.last_event_unix_ms.load(Ordering::SeqCst)
    }
}

async fn run_incremental_pass(ingestor: &Arc<SessionIngestor>, since: &Arc<AtomicI64>) {
    let since_ms = since.load(Ordering::SeqCst);
    match ingestor.parse_new_entries(since_ms).await {
        Ok(stats) => {
            since.store(now_unix_ms(), Ordering::SeqCst);
            tracing::debug!(
                processed = stats.processed,
                skipped = stats.skipped,
                "incremental ingestion pass complete"
            );
        }
        Err(e) => {
            // Catastrophic failures (store unreachable) are logged; the
            // watcher keeps running rather than compounding the outage
            // by tearing itself down (spec.md §4.4).
            tracing::error!(error = %e, "incremental ingestion pass failed");
        }
    }
}

fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
