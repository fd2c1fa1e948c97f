//! In-process publish/subscribe core with priority ordering and latency
//! accounting (spec.md §4.2).
//!
//! Event types are a closed tagged variant (`Topic`) plus a catch-all,
//! per the "no runtime reflection" design note in spec.md §9.

use crate::error::{SpecMemError, SpecMemResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Wall-clock budget for a single event's full handler chain before a
/// warning is logged (not a failure — spec.md §4.2).
const DISPATCH_WARN_THRESHOLD: Duration = Duration::from_millis(10);

/// How many recent latency samples are retained per topic for `p99`.
const LATENCY_SAMPLE_CAP: usize = 512;

/// Coordination event families. `Custom` keeps the type open for
/// downstream consumers (dashboard, host agent UI) without touching
/// this enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Topic {
    AgentRegistered,
    AgentReconnected,
    AgentHeartbeat,
    AgentStateChanged,
    AgentDisconnected,
    AgentError,
    CoordinationMessage,
    CoordinationBroadcast,
    CoordinationTaskClaimed,
    CoordinationTaskReleased,
    CoordinationHelpRequested,
    CoordinationHelpAnswered,
    IngestBatchComplete,
    Custom(String),
}

impl Topic {
    /// Stable string key used for handler-table lookup and metrics.
    pub fn key(&self) -> String {
        match self {
            Topic::AgentRegistered => "agent:registered".to_string(),
            Topic::AgentReconnected => "agent:reconnected".to_string(),
            Topic::AgentHeartbeat => "agent:heartbeat".to_string(),
            Topic::AgentStateChanged => "agent:state_changed".to_string(),
            Topic::AgentDisconnected => "agent:disconnected".to_string(),
            Topic::AgentError => "agent:error".to_string(),
            Topic::CoordinationMessage => "coordination:message".to_string(),
            Topic::CoordinationBroadcast => "coordination:broadcast".to_string(),
            Topic::CoordinationTaskClaimed => "coordination:task_claimed".to_string(),
            Topic::CoordinationTaskReleased => "coordination:task_released".to_string(),
            Topic::CoordinationHelpRequested => "coordination:help_requested".to_string(),
            Topic::CoordinationHelpAnswered => "coordination:help_answered".to_string(),
            Topic::IngestBatchComplete => "ingest:batch_complete".to_string(),
            Topic::Custom(name) => name.clone(),
        }
    }
}

/// A single bus event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: Topic,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(topic: Topic, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic,
            timestamp: Utc::now(),
            source: source.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Handler trait; implementors run inside `dispatch()`'s synchronous
/// wait, so long-running work should be spawned off rather than done
/// inline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct Subscription {
    priority: i32,
    seq: u64,
    handler: Arc<dyn Handler>,
}

#[derive(Debug, Clone, Default)]
pub struct TopicMetrics {
    pub count: u64,
    pub mean_latency_ms: f64,
    pub p99_latency_ms: f64,
}

struct LatencyWindow {
    samples: VecDeque<Duration>,
    total_count: u64,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_SAMPLE_CAP),
            total_count: 0,
        }
    }

    fn record(&mut self, d: Duration) {
        if self.samples.len() == LATENCY_SAMPLE_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(d);
        self.total_count += 1;
    }

    fn metrics(&self) -> TopicMetrics {
        if self.samples.is_empty() {
            return TopicMetrics {
                count: self.total_count,
                ..Default::default()
            };
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort();
        let mean: Duration = sorted.iter().sum::<Duration>() / sorted.len() as u32;
        let p99_idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
        let p99 = sorted[p99_idx.saturating_sub(1).min(sorted.len() - 1)];
        TopicMetrics {
            count: self.total_count,
            mean_latency_ms: mean.as_secs_f64() * 1000.0,
            p99_latency_ms: p99.as_secs_f64() * 1000.0,
        }
    }
}

/// Result of one `dispatch()` call.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub handlers_invoked: usize,
    pub errors: Vec<String>,
}

struct Inner {
    handlers: DashMap<String, RwLock<Vec<Subscription>>>,
    latencies: DashMap<String, std::sync::Mutex<LatencyWindow>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
}

/// Cheap-to-clone handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBus(Arc<Inner>);

impl EventBus {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            handlers: DashMap::new(),
            latencies: DashMap::new(),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
        }))
    }

    /// Attach a handler to a topic. Higher `priority` runs first; ties
    /// break by registration order.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn Handler>, priority: i32) {
        let key = topic.key();
        let seq = self.0.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .0
            .handlers
            .entry(key)
            .or_insert_with(|| RwLock::new(Vec::new()));
        entry
            .write()
            .expect("event bus handler lock poisoned")
            .push(Subscription {
                priority,
                seq,
                handler,
            });
    }

    /// Begin posting `event`. Chain `.dispatch()` for a synchronous,
    /// awaited send, or `.fire_and_forget()` for the async/fire-and-
    /// forget mode spec.md calls `async()` (a reserved keyword in Rust).
    pub fn post(&self, event: Event) -> Posted {
        Posted {
            bus: self.clone(),
            event,
        }
    }

    /// Per-topic dispatch counts and latency percentiles.
    pub fn metrics(&self) -> HashMap<String, TopicMetrics> {
        self.0
            .latencies
            .iter()
            .map(|entry| {
                let metrics = entry
                    .value()
                    .lock()
                    .expect("event bus latency lock poisoned")
                    .metrics();
                (entry.key().clone(), metrics)
            })
            .collect()
    }

    /// Drain in-flight dispatches up to `timeout`, then stop accepting
    /// new posts regardless of whether the drain finished.
    pub async fn shutdown(&self, timeout: Duration) {
        self.0.closed.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while self.0.inflight.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(Duration::from_millis(25));
            let _ = tokio::time::timeout(wait, self.0.drained.notified()).await;
        }
    }

    async fn dispatch_now(&self, event: Event) -> SpecMemResult<DispatchOutcome> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(SpecMemError::BusClosed);
        }
        self.0.inflight.fetch_add(1, Ordering::SeqCst);
        let key = event.topic.key();
        let start = Instant::now();

        let subs: Vec<Arc<dyn Handler>> = match self.0.handlers.get(&key) {
            Some(list) => {
                let guard = list.read().expect("event bus handler lock poisoned");
                let mut ordered: Vec<&Subscription> = guard.iter().collect();
                ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
                ordered.into_iter().map(|s| s.handler.clone()).collect()
            }
            None => Vec::new(),
        };

        let mut outcome = DispatchOutcome {
            handlers_invoked: 0,
            errors: Vec::new(),
        };
        for handler in subs {
            outcome.handlers_invoked += 1;
            if let Err(e) = handler.handle(&event).await {
                outcome.errors.push(e.to_string());
            }
        }

        let elapsed = start.elapsed();
        self.0
            .latencies
            .entry(key.clone())
            .or_insert_with(|| std::sync::Mutex::new(LatencyWindow::new()))
            .lock()
            .expect("event bus latency lock poisoned")
            .record(elapsed);

        if elapsed > DISPATCH_WARN_THRESHOLD {
            tracing::warn!(
                topic = %key,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "event dispatch exceeded the 10ms target"
            );
        }

        self.0.inflight.fetch_sub(1, Ordering::SeqCst);
        self.0.drained.notify_waiters();
        Ok(outcome)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A built-but-not-yet-sent event, returned by [`EventBus::post`].
pub struct Posted {
    bus: EventBus,
    event: Event,
}

impl Posted {
    /// Synchronous dispatch: awaits every handler and returns the
    /// aggregate outcome.
    pub async fn dispatch(self) -> SpecMemResult<DispatchOutcome> {
        self.bus.dispatch_now(self.event).await
    }

    /// Fire-and-forget dispatch: runs on a spawned task; handler errors
    /// are logged, never surfaced to the caller.
    pub fn fire_and_forget(self) {
        let bus = self.bus;
        let event = self.event;
        tokio::spawn(async move {
            match bus.dispatch_now(event).await {
                Ok(outcome) if !outcome.errors.is_empty() => {
                    tracing::warn!(errors = ?outcome.errors, "fire-and-forget dispatch had handler errors");
                }
                Err(e) => tracing::warn!(error = %e, "fire-and-forget dispatch rejected"),
                _ => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct CountingHandler {
        calls: Arc<StdAtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("handler failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_invokes_all_handlers_and_isolates_errors() {
        let bus = EventBus::new();
        let calls = Arc::new(StdAtomicUsize::new(0));
        bus.subscribe(
            Topic::AgentHeartbeat,
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail: true,
            }),
            0,
        );
        bus.subscribe(
            Topic::AgentHeartbeat,
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail: false,
            }),
            0,
        );

        let outcome = bus
            .post(Event::new(Topic::AgentHeartbeat, "agent-1", serde_json::json!({})))
            .dispatch()
            .await
            .unwrap();

        assert_eq!(outcome.handlers_invoked, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn higher_priority_runs_first() {
        let bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct OrderHandler {
            order: Arc<std::sync::Mutex<Vec<i32>>>,
            id: i32,
        }
        #[async_trait]
        impl Handler for OrderHandler {
            async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
                self.order.lock().unwrap().push(self.id);
                Ok(())
            }
        }

        bus.subscribe(
            Topic::AgentHeartbeat,
            Arc::new(OrderHandler {
                order: order.clone(),
                id: 1,
            }),
            1,
        );
        bus.subscribe(
            Topic::AgentHeartbeat,
            Arc::new(OrderHandler {
                order: order.clone(),
                id: 2,
            }),
            10,
        );

        bus.post(Event::new(Topic::AgentHeartbeat, "a", serde_json::json!({})))
            .dispatch()
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn post_after_shutdown_fails_with_bus_closed() {
        let bus = EventBus::new();
        bus.shutdown(Duration::from_millis(50)).await;

        let err = bus
            .post(Event::new(Topic::AgentHeartbeat, "a", serde_json::json!({})))
            .dispatch()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "BusClosed");
    }
}
