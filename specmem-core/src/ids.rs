//! Identifier types and the single deterministic-hashing helper every
//! other derivation (schema names, channel ids, entry/content hashes)
//! is built from.
//!
//! Per the design note in spec.md §9: deterministic identifier
//! derivation belongs in one place. No other component invents ids.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hashes the given parts (joined with a `\u{1f}` unit separator so
/// "ab"+"c" and "a"+"bc" never collide) and returns the full 64-hex-char
/// digest.
pub fn stable_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Same as [`stable_digest`], truncated to the first 16 hex characters.
/// Used for `entry_hash`/`content_hash` (spec.md §3) and for channel ids.
pub fn stable_digest16(parts: &[&str]) -> String {
    stable_digest(parts)[..16].to_string()
}

/// An agent-supplied identifier. Agents choose their own ids; the
/// registry only requires uniqueness (spec.md §3 AgentEntry invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A deterministic, stable-across-restarts channel identifier, derived
/// from `(project_path, channel_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn derive(project_path: &str, channel_name: &str) -> Self {
        Self(stable_digest16(&["channel", project_path, channel_name]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(stable_digest16(&["a", "b"]), stable_digest16(&["a", "b"]));
    }

    #[test]
    fn digest_distinguishes_part_boundaries() {
        assert_ne!(stable_digest16(&["ab", "c"]), stable_digest16(&["a", "bc"]));
    }

    #[test]
    fn channel_id_is_pure_function_of_inputs() {
        let a = ChannelId::derive("/p/a", "main");
        let b = ChannelId::derive("/p/a", "main");
        let c = ChannelId::derive("/p/a", "broadcast");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
