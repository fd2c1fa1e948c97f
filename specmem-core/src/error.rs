//! Shared error taxonomy for every specmem component.
//!
//! Every surfaced error carries a short human-readable message and a
//! structured kind; callers match on the kind, humans read the message.

use thiserror::Error;

/// Typed error kinds shared by the event bus, the agent registry, the
/// session ingestor and the coordination store.
#[derive(Debug, Error)]
pub enum SpecMemError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("already released: {0}")]
    AlreadyReleased(String),

    #[error("bus closed")]
    BusClosed,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("ack failure: {0}")]
    AckFailure(String),
}

impl SpecMemError {
    /// Stable, machine-matchable name of the error kind (for logging and
    /// for callers that want to branch without a `match`).
    pub fn kind(&self) -> &'static str {
        match self {
            SpecMemError::InvalidInput(_) => "InvalidInput",
            SpecMemError::NotFound(_) => "NotFound",
            SpecMemError::Forbidden(_) => "Forbidden",
            SpecMemError::CapacityExhausted(_) => "CapacityExhausted",
            SpecMemError::AlreadyReleased(_) => "AlreadyReleased",
            SpecMemError::BusClosed => "BusClosed",
            SpecMemError::Timeout(_) => "Timeout",
            SpecMemError::Storage(_) => "Storage",
            SpecMemError::ParseError(_) => "ParseError",
            SpecMemError::AckFailure(_) => "AckFailure",
        }
    }
}

pub type SpecMemResult<T> = std::result::Result<T, SpecMemError>;
