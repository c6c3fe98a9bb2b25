//! Layered memory: long-term facts, daily notes, and per-session logs,
//! behind one store contract with a file-backed implementation and a
//! high-level manager.

pub mod file_store;
pub mod manager;
pub mod types;

pub use file_store::{FileMemoryStore, safe_key};
pub use manager::{FactExtractor, MemoryManager, Summarizer, resolve_user_id};
pub use types::{
    ChatMessage, CompactionCache, MemoryEntry, MemoryError, MemoryKind, MemoryStore, Role,
    SessionIndexEntry, SessionSummary,
};
