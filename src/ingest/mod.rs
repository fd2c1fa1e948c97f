//! The Session Ingestion Pipeline (spec.md §4.4): discovers, parses,
//! deduplicates, embeds, and persists conversational session files.

pub mod discovery;
pub mod parser;
pub mod pipeline;
pub mod watcher;

pub use discovery::default_session_source_dir;
pub use parser::{EntryKind, ParseLineError, Role, SessionEntry, ToolCall};
pub use pipeline::{IngestStats, SessionIngestor};
pub use watcher::SessionWatcher;
