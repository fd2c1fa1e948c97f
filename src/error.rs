//! Error-handling utilities layered on top of [`specmem_core::error`].

pub use specmem_core::error::{SpecMemError, SpecMemResult};

use anyhow::{Context, Result};

/// Adds a standard "Failed to ..." context prefix, mirroring the
/// teacher's own `ResultExt` convention.
pub trait ResultExt<T> {
    fn context_op(self, operation: &str) -> Result<T>;
    fn context_path(self, operation: &str, path: &std::path::Path) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_op(self, operation: &str) -> Result<T> {
        self.context(format!("Failed to {operation}"))
    }

    fn context_path(self, operation: &str, path: &std::path::Path) -> Result<T> {
        self.context(format!("Failed to {operation} at '{}'", path.display()))
    }
}
