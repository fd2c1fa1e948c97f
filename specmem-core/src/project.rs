//! Project identity: derives the current project path and every
//! per-project identifier other components need, as pure functions of
//! that path (spec.md §4.1).

use crate::error::{SpecMemError, SpecMemResult};
use crate::ids::{stable_digest16, ChannelId};
use std::env;
use std::path::{Path, PathBuf};

/// Channels every project always provisions (spec.md §3).
pub const DEFAULT_CHANNELS: &[&str] = &[
    "main", "broadcast", "swarm-1", "swarm-2", "swarm-3", "swarm-4", "swarm-5",
];

/// Deterministic, alphanumeric-and-underscore schema name for a project
/// path, bounded to a length Postgres accepts as an identifier.
///
/// This is a pure function of `path` — the single documented exception
/// to "no string concatenation in SQL" (spec.md §9) lives downstream of
/// this function, never inside it.
pub fn schema_name(path: &str) -> String {
    let digest = stable_digest16(&["schema", path]);
    format!("specmem_{digest}")
}

/// Deterministic channel id for `(project, channel_name)`.
pub fn channel_id(path: &str, channel_name: &str) -> ChannelId {
    ChannelId::derive(path, channel_name)
}

/// Deterministic path to the embedding sidecar's unix-domain socket,
/// rooted under the project directory (spec.md §6).
pub fn socket_path(path: &str) -> PathBuf {
    Path::new(path).join("specmem").join("sockets").join("embed.sock")
}

/// Deterministic path to the project's sockets directory (used both for
/// the sidecar socket and for best-effort UI state files, spec.md §4.5).
pub fn sockets_dir(path: &str) -> PathBuf {
    Path::new(path).join("specmem").join("sockets")
}

/// A short, filesystem-safe hash of the project path, used to namespace
/// the `/tmp/specmem-<hash>/...` tree that carries the channel-
/// assignment file (spec.md §6).
pub fn project_hash(path: &str) -> String {
    stable_digest16(&["tmp-hash", path])
}

/// `/tmp/specmem-<hash>/agent-channels` — where per-agent channel
/// assignment files live (spec.md §6).
pub fn agent_channels_dir(path: &str) -> PathBuf {
    env::temp_dir()
        .join(format!("specmem-{}", project_hash(path)))
        .join("agent-channels")
}

/// A thin, ergonomic wrapper around an absolute, canonicalized project
/// path. Holds no other state: every derivation is delegated to the
/// free functions above so a stale `ProjectContext` can never diverge
/// from what a fresh call to `schema_name`/`channel_id` would produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    path: PathBuf,
}

impl ProjectContext {
    /// Build a context for an explicit path, canonicalizing it so two
    /// different spellings of the same directory never diverge.
    pub fn for_path(path: impl AsRef<Path>) -> SpecMemResult<Self> {
        let canonical = path
            .as_ref()
            .canonicalize()
            .map_err(|e| SpecMemError::InvalidInput(format!("invalid project path: {e}")))?;
        Ok(Self { path: canonical })
    }

    /// Build a context from the process's current working directory.
    pub fn from_cwd() -> SpecMemResult<Self> {
        let cwd = env::current_dir()
            .map_err(|e| SpecMemError::Storage(format!("cannot read cwd: {e}")))?;
        Self::for_path(cwd)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_str(&self) -> &str {
        self.path.to_str().unwrap_or_default()
    }

    pub fn schema_name(&self) -> String {
        schema_name(self.path_str())
    }

    pub fn channel_id(&self, name: &str) -> ChannelId {
        channel_id(self.path_str(), name)
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path(self.path_str())
    }

    pub fn sockets_dir(&self) -> PathBuf {
        sockets_dir(self.path_str())
    }

    pub fn agent_channels_dir(&self) -> PathBuf {
        agent_channels_dir(self.path_str())
    }

    pub fn project_hash(&self) -> String {
        project_hash(self.path_str())
    }

    /// True if `other` equals this project, is a subdirectory of it, or
    /// is a parent of it (the SessionIngestor's project-scoping
    /// predicate, spec.md §4.4).
    pub fn scopes(&self, other: &Path) -> bool {
        self.path == other || self.path.starts_with(other) || other.starts_with(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_name_is_pure_and_safe() {
        let a = schema_name("/p/a");
        let b = schema_name("/p/a");
        let c = schema_name("/p/b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'));
    }

    #[test]
    fn channel_id_is_pure() {
        assert_eq!(channel_id("/p/a", "main"), channel_id("/p/a", "main"));
        assert_ne!(channel_id("/p/a", "main"), channel_id("/p/a", "broadcast"));
    }

    #[test]
    fn scopes_covers_equal_parent_and_child() {
        let ctx = ProjectContext {
            path: PathBuf::from("/p/a"),
        };
        assert!(ctx.scopes(Path::new("/p/a")));
        assert!(ctx.scopes(Path::new("/p/a/sub")));
        assert!(ctx.scopes(Path::new("/p")));
        assert!(!ctx.scopes(Path::new("/p/b")));
    }
}
