//! # specmem
//!
//! Per-project memory and coordination substrate for AI coding agents:
//! the Session Ingestion Pipeline and the per-project Coordination Bus,
//! built on `specmem-core`'s `ProjectContext`, `EventBus`, and
//! `AgentRegistry` primitives.
//!
//! This crate is a library. The tool-dispatch front-end, CLI
//! scaffolding, hook deployment, and dashboard/TUI that would consume
//! it are out of scope (spec.md §1) — callers wire `SpecMem` into
//! whatever front-end they run.

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod store;

pub use config::Settings;
pub use db::PoolManager;
pub use embedding::EmbeddingClient;
pub use error::{ResultExt, SpecMemError, SpecMemResult};
pub use ingest::{IngestStats, SessionIngestor, SessionWatcher};
pub use specmem_core::{
    AgentDescriptor, AgentRegistry, AgentState, ChannelId, Event, EventBus, ProjectContext, Topic,
};
pub use store::{
    BroadcastType, ClearStats, ClearTeamMessagesOptions, CoordinationStore, HelpRequest, Message,
    MessagePriority, MessageType, ReadMessagesQuery, SendMessageRequest, TaskClaim, TeamStatus,
};

use std::path::PathBuf;
use std::sync::Arc;

/// Everything one project needs: the ingestion pipeline, the
/// coordination store, the event bus, and the agent registry, wired
/// together from [`Settings`] (spec.md §2's three subsystems sharing
/// project isolation, dedup discipline, and resource contracts).
pub struct SpecMem {
    pub project: ProjectContext,
    pub bus: EventBus,
    pub registry: Arc<AgentRegistry>,
    pub ingestor: Arc<SessionIngestor>,
    pub store: Arc<CoordinationStore>,
    pools: Arc<PoolManager>,
}

impl SpecMem {
    /// Builds every component for `project`, bootstrapping its schema
    /// and default channels. Does not start the watcher or the
    /// registry's cleanup timer — call [`SpecMem::start`] for that.
    pub async fn new(project: ProjectContext, settings: Settings, source_root: PathBuf) -> SpecMemResult<Self> {
        let bus = EventBus::new();
        let pools = PoolManager::new(settings.database_url.clone());
        let registry = Arc::new(AgentRegistry::new(
            bus.clone(),
            settings.registry_max_size,
            settings.heartbeat_timeout(),
        ));
        let embeddings = Arc::new(EmbeddingClient::new(
            project.socket_path(),
            settings.embedding_timeout(),
            1536,
        ));
        let ingestor = Arc::new(SessionIngestor::new(
            project.clone(),
            pools.clone(),
            embeddings,
            bus.clone(),
            settings.clone(),
            source_root,
        ));
        let store = Arc::new(CoordinationStore::new(project.clone(), pools.clone(), bus.clone()).await?);

        Ok(Self {
            project,
            bus,
            registry,
            ingestor,
            store,
            pools,
        })
    }

    /// Starts the registry's periodic cleanup timer and runs an
    /// initial catch-up ingestion pass. Returns the catch-up stats; the
    /// caller should follow with [`SessionWatcher::spawn`] for ongoing
    /// incremental ingestion.
    pub async fn start(&self, settings: &Settings) -> SpecMemResult<IngestStats> {
        self.registry.spawn_cleanup_task(settings.heartbeat_interval());
        self.ingestor
            .catch_up()
            .await
            .map_err(|e| SpecMemError::Storage(e.to_string()))
    }

    /// Graceful shutdown, in the order spec.md §5 prescribes: drain the
    /// bus, then stop the registry's timers (the ingestor's watcher is
    /// owned by the caller, which stops it before this).
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        self.bus.shutdown(timeout).await;
        let _ = &self.pools;
    }
}
