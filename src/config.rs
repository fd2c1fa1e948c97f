//! Runtime configuration: the environment-variable tunables spec.md §6
//! names, loaded once at startup through the `config` crate the way the
//! teacher's own config layer builds up defaults before overlaying the
//! environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// All externally tunable knobs. Every field has the default spec.md
/// §6 specifies; each can be overridden by an `SPECMEM_*` environment
/// variable (e.g. `SPECMEM_HEARTBEAT_TIMEOUT_SECS=45`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub registry_max_size: usize,

    pub ingest_batch_size: usize,
    pub ingest_throughput_bytes_per_sec: u64,
    pub ingest_chunk_delay_ms: u64,
    pub ingest_early_exit_threshold: usize,

    pub watcher_debounce_ms: u64,
    pub watcher_heartbeat_secs: u64,
    pub startup_grace_period_secs: u64,

    /// Postgres-compatible connection string for the relational/vector
    /// store (spec.md §6 — external collaborator, but its address is a
    /// core tunable).
    pub database_url: String,

    /// Embedding-sidecar request timeout, after which the ingestor
    /// falls back to a deterministic local vector (spec.md §5).
    pub embedding_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            registry_max_size: 100,

            ingest_batch_size: 100,
            ingest_throughput_bytes_per_sec: 100 * 1024 * 1024,
            ingest_chunk_delay_ms: 10,
            ingest_early_exit_threshold: 50,

            watcher_debounce_ms: 2_000,
            watcher_heartbeat_secs: 30,
            startup_grace_period_secs: 60,

            database_url: "postgres://localhost/specmem".to_string(),
            embedding_timeout_ms: 5_000,
        }
    }
}

impl Settings {
    /// Layer built-in defaults with `SPECMEM_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Settings::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::Environment::with_prefix("SPECMEM").separator("__"));
        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn ingest_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.ingest_chunk_delay_ms)
    }

    pub fn watcher_debounce(&self) -> Duration {
        Duration::from_millis(self.watcher_debounce_ms)
    }

    pub fn watcher_heartbeat(&self) -> Duration {
        Duration::from_secs(self.watcher_heartbeat_secs)
    }

    pub fn startup_grace_period(&self) -> Duration {
        Duration::from_secs(self.startup_grace_period_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let settings = Settings::default();
        assert_eq!(settings.heartbeat_interval_secs, 10);
        assert_eq!(settings.heartbeat_timeout_secs, 30);
        assert_eq!(settings.registry_max_size, 100);
        assert_eq!(settings.ingest_batch_size, 100);
        assert_eq!(settings.ingest_early_exit_threshold, 50);
    }
}
