//! # specmem-core
//!
//! Leaf-first coordination primitives shared by the `specmem` crate:
//! project identity derivation, the in-process event bus, and the
//! in-memory agent registry. No database access, no filesystem
//! scanning, no sidecar client lives here — those belong to `specmem`
//! itself, which is built on top of this crate.
//!
//! ## Modules
//!
//! - [`error`] — the shared `SpecMemError` taxonomy
//! - [`ids`] — deterministic identifier derivation (`AgentId`, `ChannelId`)
//! - [`project`] — `ProjectContext` and its pure-function derivations
//! - [`bus`] — the topic-keyed publish/subscribe `EventBus`
//! - [`registry`] — the `AgentRegistry` state machine

pub mod bus;
pub mod error;
pub mod ids;
pub mod project;
pub mod registry;

pub use bus::{DispatchOutcome, Event, EventBus, Handler, Posted, Topic, TopicMetrics};
pub use error::{SpecMemError, SpecMemResult};
pub use ids::{stable_digest, stable_digest16, AgentId, ChannelId};
pub use project::{ProjectContext, DEFAULT_CHANNELS};
pub use registry::{
    AgentDescriptor, AgentEntry, AgentMetrics, AgentRegistry, AgentState, RegisterOutcome,
    UnregisterReason,
};

/// Crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the process-wide structured logging subscriber. Callers
/// own whether/when to call this; the library never initializes
/// logging implicitly.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
