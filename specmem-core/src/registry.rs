//! Tracks active agents, enforces heartbeat liveness, and emits
//! lifecycle events onto the [`EventBus`] (spec.md §4.3).

use crate::bus::{Event, EventBus, Topic};
use crate::error::{SpecMemError, SpecMemResult};
use crate::ids::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a caller registers: the agent's own identity and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Initializing,
    Ready,
    Working,
    WaitingPermission,
    Blocked,
    Completed,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterReason {
    Normal,
    Timeout,
    Error,
    Kicked,
}

impl UnregisterReason {
    fn as_str(&self) -> &'static str {
        match self {
            UnregisterReason::Normal => "normal",
            UnregisterReason::Timeout => "timeout",
            UnregisterReason::Error => "error",
            UnregisterReason::Kicked => "kicked",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub heartbeats_received: u64,
    pub events_processed: u64,
    pub errors_encountered: u64,
    pub tasks_completed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub agent: AgentDescriptor,
    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connection_id: Option<String>,
    pub metrics: AgentMetrics,
}

/// Outcome of [`AgentRegistry::register`], distinguishing a brand-new
/// registration from an in-place reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    Reconnected,
}

struct State {
    entries: HashMap<AgentId, AgentEntry>,
    connections: HashMap<String, AgentId>,
}

struct Inner {
    state: Mutex<State>,
    bus: EventBus,
    max_size: usize,
    heartbeat_timeout: Duration,
}

/// Cheap-to-clone handle to the agent registry. All mutating operations
/// are serialized under a single coarse lock (spec.md §4.3); event
/// emission happens after the lock is released.
#[derive(Clone)]
pub struct AgentRegistry(Arc<Inner>);

impl AgentRegistry {
    pub fn new(bus: EventBus, max_size: usize, heartbeat_timeout: Duration) -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(State {
                entries: HashMap::new(),
                connections: HashMap::new(),
            }),
            bus,
            max_size,
            heartbeat_timeout,
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.0.state.lock().expect("agent registry lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new agent, or update an existing entry in place.
    pub fn register(
        &self,
        agent: AgentDescriptor,
        connection_id: Option<String>,
    ) -> SpecMemResult<RegisterOutcome> {
        let now = Utc::now();
        let agent_id = agent.agent_id.clone();
        let outcome = {
            let mut state = self.lock();
            let exists = state.entries.contains_key(&agent_id);
            if !exists && state.entries.len() >= self.0.max_size {
                return Err(SpecMemError::CapacityExhausted(format!(
                    "registry at capacity ({})",
                    self.0.max_size
                )));
            }

            if let Some(conn) = &connection_id {
                state.connections.insert(conn.clone(), agent_id.clone());
            }

            if let Some(entry) = state.entries.get_mut(&agent_id) {
                entry.agent = agent;
                entry.state = AgentState::Ready;
                entry.last_activity = now;
                entry.connection_id = connection_id;
                RegisterOutcome::Reconnected
            } else {
                state.entries.insert(
                    agent_id.clone(),
                    AgentEntry {
                        agent,
                        state: AgentState::Initializing,
                        registered_at: now,
                        last_heartbeat: now,
                        last_activity: now,
                        connection_id,
                        metrics: AgentMetrics::default(),
                    },
                );
                RegisterOutcome::Registered
            }
        };

        let topic = match outcome {
            RegisterOutcome::Registered => Topic::AgentRegistered,
            RegisterOutcome::Reconnected => Topic::AgentReconnected,
        };
        self.emit(topic, &agent_id, serde_json::json!({"agent_id": agent_id.as_str()}));
        Ok(outcome)
    }

    pub fn unregister(&self, agent_id: &AgentId, reason: UnregisterReason) -> SpecMemResult<()> {
        let removed = {
            let mut state = self.lock();
            let removed = state.entries.remove(agent_id);
            state.connections.retain(|_, v| v != agent_id);
            removed
        };
        if removed.is_none() {
            return Err(SpecMemError::NotFound(format!("agent {agent_id} not registered")));
        }
        self.emit(
            Topic::AgentDisconnected,
            agent_id,
            serde_json::json!({"agent_id": agent_id.as_str(), "reason": reason.as_str()}),
        );
        Ok(())
    }

    /// Update `last_heartbeat` (monotonically — an out-of-order,
    /// earlier heartbeat is accepted but never regresses the stored
    /// time) and optionally transition state.
    pub fn heartbeat(&self, agent_id: &AgentId, state: Option<AgentState>) -> SpecMemResult<()> {
        let now = Utc::now();
        let state_changed = {
            let mut guard = self.lock();
            let entry = guard
                .entries
                .get_mut(agent_id)
                .ok_or_else(|| SpecMemError::NotFound(format!("agent {agent_id} not registered")))?;
            if now > entry.last_heartbeat {
                entry.last_heartbeat = now;
            }
            entry.last_activity = now;
            entry.metrics.heartbeats_received += 1;
            match state {
                Some(new_state) if new_state != entry.state => {
                    entry.state = new_state;
                    Some(new_state)
                }
                _ => None,
            }
        };

        self.emit(
            Topic::AgentHeartbeat,
            agent_id,
            serde_json::json!({"agent_id": agent_id.as_str()}),
        );
        if let Some(new_state) = state_changed {
            self.on_state_changed(agent_id, new_state);
        }
        Ok(())
    }

    /// Record a transition, emitting `agent:state_changed` only if the
    /// state actually changed.
    pub fn set_state(&self, agent_id: &AgentId, new_state: AgentState) -> SpecMemResult<()> {
        let changed = {
            let mut guard = self.lock();
            let entry = guard
                .entries
                .get_mut(agent_id)
                .ok_or_else(|| SpecMemError::NotFound(format!("agent {agent_id} not registered")))?;
            if entry.state == new_state {
                false
            } else {
                entry.state = new_state;
                entry.last_activity = Utc::now();
                true
            }
        };
        if changed {
            self.on_state_changed(agent_id, new_state);
        }
        Ok(())
    }

    fn on_state_changed(&self, agent_id: &AgentId, new_state: AgentState) {
        self.emit(
            Topic::AgentStateChanged,
            agent_id,
            serde_json::json!({"agent_id": agent_id.as_str(), "state": format!("{new_state:?}")}),
        );
        if new_state == AgentState::Completed {
            self.schedule_completed_reset(agent_id.clone());
        }
    }

    /// `completed -> ready` fires automatically after a short fixed
    /// delay unless the entry has already transitioned away
    /// (spec.md §4.3).
    fn schedule_completed_reset(&self, agent_id: AgentId) {
        let weak = Arc::downgrade(&self.0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(inner) = weak.upgrade() {
                let registry = AgentRegistry(inner);
                registry.reset_if_still_completed(&agent_id);
            }
        });
    }

    fn reset_if_still_completed(&self, agent_id: &AgentId) {
        let changed = {
            let mut guard = self.lock();
            match guard.entries.get_mut(agent_id) {
                Some(entry) if entry.state == AgentState::Completed => {
                    entry.state = AgentState::Ready;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(
                Topic::AgentStateChanged,
                agent_id,
                serde_json::json!({"agent_id": agent_id.as_str(), "state": "Ready"}),
            );
        }
    }

    pub fn record_error(&self, agent_id: &AgentId) -> SpecMemResult<()> {
        self.bump(agent_id, |m| m.errors_encountered += 1)?;
        self.emit(
            Topic::AgentError,
            agent_id,
            serde_json::json!({"agent_id": agent_id.as_str()}),
        );
        Ok(())
    }

    pub fn record_task_completion(&self, agent_id: &AgentId) -> SpecMemResult<()> {
        self.bump(agent_id, |m| m.tasks_completed += 1)
    }

    pub fn record_event_processed(&self, agent_id: &AgentId) -> SpecMemResult<()> {
        self.bump(agent_id, |m| m.events_processed += 1)
    }

    fn bump(&self, agent_id: &AgentId, f: impl FnOnce(&mut AgentMetrics)) -> SpecMemResult<()> {
        let mut guard = self.lock();
        let entry = guard
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| SpecMemError::NotFound(format!("agent {agent_id} not registered")))?;
        f(&mut entry.metrics);
        Ok(())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentEntry> {
        self.lock().entries.get(agent_id).cloned()
    }

    pub fn by_state(&self, state: AgentState) -> Vec<AgentEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect()
    }

    pub fn by_type(&self, agent_type: &str) -> Vec<AgentEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.agent.agent_type == agent_type)
            .cloned()
            .collect()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<AgentEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.agent.capabilities.iter().any(|c| c == capability))
            .cloned()
            .collect()
    }

    pub fn by_priority(&self) -> Vec<AgentEntry> {
        let mut entries: Vec<AgentEntry> = self.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| b.agent.priority.cmp(&a.agent.priority));
        entries
    }

    pub fn active(&self) -> Vec<AgentEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.state != AgentState::Disconnected)
            .cloned()
            .collect()
    }

    pub fn stale(&self) -> Vec<AgentEntry> {
        let now = Utc::now();
        let timeout = self.0.heartbeat_timeout;
        self.lock()
            .entries
            .values()
            .filter(|e| {
                now.signed_duration_since(e.last_heartbeat)
                    .to_std()
                    .map(|d| d > timeout)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Evict every entry exceeding `heartbeat_timeout` since its last
    /// heartbeat, emitting a `timeout` disconnection for each.
    pub fn cleanup_stale(&self) -> Vec<AgentId> {
        let stale_ids: Vec<AgentId> = self.stale().into_iter().map(|e| e.agent.agent_id).collect();
        for id in &stale_ids {
            let _ = self.unregister(id, UnregisterReason::Timeout);
        }
        stale_ids
    }

    /// Spawn a periodic background cleanup timer holding only a weak
    /// reference, so registry drop stops it without an explicit call
    /// racing a live task (spec.md §4.3, §5).
    pub fn spawn_cleanup_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.0);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        let registry = AgentRegistry(inner);
                        let evicted = registry.cleanup_stale();
                        if !evicted.is_empty() {
                            tracing::info!(count = evicted.len(), "evicted stale agents");
                        }
                    }
                    None => break,
                }
            }
        })
    }

    pub fn export_state(&self) -> Vec<AgentEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn import_state(&self, entries: Vec<AgentEntry>) {
        let mut guard = self.lock();
        guard.entries.clear();
        guard.connections.clear();
        for entry in entries {
            if let Some(conn) = &entry.connection_id {
                guard.connections.insert(conn.clone(), entry.agent.agent_id.clone());
            }
            guard.entries.insert(entry.agent.agent_id.clone(), entry);
        }
    }

    fn emit(&self, topic: Topic, agent_id: &AgentId, payload: serde_json::Value) {
        self.0
            .bus
            .post(Event::new(topic, agent_id.as_str(), payload))
            .fire_and_forget();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: AgentId::new(id),
            name: id.to_string(),
            agent_type: "worker".to_string(),
            capabilities: vec!["rust".to_string()],
            priority: 0,
        }
    }

    #[tokio::test]
    async fn register_heartbeat_unregister_roundtrip_is_size_neutral() {
        let registry = AgentRegistry::new(EventBus::new(), 10, Duration::from_secs(30));
        let id = AgentId::new("a1");
        let before = registry.len();

        registry.register(descriptor("a1"), None).unwrap();
        registry.heartbeat(&id, None).unwrap();
        registry.unregister(&id, UnregisterReason::Normal).unwrap();

        assert_eq!(registry.len(), before);
    }

    #[tokio::test]
    async fn capacity_exhausted_when_full() {
        let registry = AgentRegistry::new(EventBus::new(), 1, Duration::from_secs(30));
        registry.register(descriptor("a1"), None).unwrap();
        let err = registry.register(descriptor("a2"), None).unwrap_err();
        assert_eq!(err.kind(), "CapacityExhausted");
    }

    #[tokio::test]
    async fn heartbeat_never_regresses() {
        let registry = AgentRegistry::new(EventBus::new(), 10, Duration::from_secs(30));
        let id = AgentId::new("a1");
        registry.register(descriptor("a1"), None).unwrap();
        registry.heartbeat(&id, None).unwrap();
        let after_first = registry.get(&id).unwrap().last_heartbeat;

        {
            let mut guard = registry.lock();
            guard.entries.get_mut(&id).unwrap().last_heartbeat =
                after_first + chrono::Duration::seconds(5);
        }
        let bumped = registry.get(&id).unwrap().last_heartbeat;

        registry.heartbeat(&id, None).unwrap();
        let after_second = registry.get(&id).unwrap().last_heartbeat;
        assert!(after_second >= bumped);
    }

    #[tokio::test]
    async fn reregistration_transitions_to_ready() {
        let registry = AgentRegistry::new(EventBus::new(), 10, Duration::from_secs(30));
        registry.register(descriptor("a1"), None).unwrap();
        let outcome = registry.register(descriptor("a1"), None).unwrap();
        assert_eq!(outcome, RegisterOutcome::Reconnected);
        assert_eq!(registry.get(&AgentId::new("a1")).unwrap().state, AgentState::Ready);
    }
}
