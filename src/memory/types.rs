//! Core types and the `MemoryStore` trait for the memory subsystem.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── MemoryKind ───────────────────────────────────────────────────────────────

/// The three memory tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Persistent facts, tagged, optionally scoped to a user.
    LongTerm,
    /// Chronological notes, globally scoped, one markdown file per day.
    Daily,
    /// Ordered message log for one session key.
    Session,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryKind::LongTerm => write!(f, "long_term"),
            MemoryKind::Daily => write!(f, "daily"),
            MemoryKind::Session => write!(f, "session"),
        }
    }
}

// ─── Role ─────────────────────────────────────────────────────────────────────

/// Speaker of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

// ─── MemoryEntry ──────────────────────────────────────────────────────────────

/// One stored memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    /// Session entries only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Session entries only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// May carry `header`, `user_id`, and `source` for markdown-backed tiers.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MemoryEntry {
    pub fn long_term(content: impl Into<String>) -> Self {
        Self::blank(MemoryKind::LongTerm, content)
    }

    pub fn daily(content: impl Into<String>) -> Self {
        Self::blank(MemoryKind::Daily, content)
    }

    pub fn session(
        session_key: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Some(role),
            session_key: Some(session_key.into()),
            ..Self::blank(MemoryKind::Session, content)
        }
    }

    fn blank(kind: MemoryKind, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            kind,
            content: content.into(),
            role: None,
            session_key: None,
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.metadata
            .insert("header".to_owned(), serde_json::Value::String(header.into()));
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.metadata
            .insert("user_id".to_owned(), serde_json::Value::String(user_id.into()));
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// String-valued metadata lookup helper.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

// ─── ChatMessage ──────────────────────────────────────────────────────────────

/// A `{role, content}` pair — the shape shared between compacted history and
/// backend prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

// ─── SessionSummary ───────────────────────────────────────────────────────────

/// One row of a chat's session listing (`/sessions`, session tools).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_key: String,
    pub title: String,
    pub last_activity: String,
    pub message_count: usize,
    pub preview: String,
    pub is_active: bool,
}

// ─── CompactionCache ──────────────────────────────────────────────────────────

/// Cached Tier-2 summary for one session, keyed by the total message count
/// at the time of summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionCache {
    pub watermark: usize,
    pub summary: String,
    pub older_count: usize,
}

// ─── MemoryError ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

// ─── MemoryStore trait ────────────────────────────────────────────────────────

/// Backend contract shared by the file store and any semantic store.
///
/// `auto_learn` and `semantic_search` are optional capabilities; the default
/// implementations report `Unsupported` / `None` and the manager falls back.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist an entry. Long-term and daily entries deduplicate by
    /// `(source, header, content)`; session entries append. Returns the
    /// stable id.
    async fn save(&self, entry: MemoryEntry) -> Result<String, MemoryError>;

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, MemoryError>;

    /// Remove an entry by id. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, MemoryError>;

    /// All entries of one kind. When `user_id` is set for `LongTerm`, only
    /// entries in that scope are returned.
    async fn get_by_kind(
        &self,
        kind: MemoryKind,
        limit: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// The full ordered message log for a session.
    async fn get_session(&self, session_key: &str) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// Remove all entries for a session. Returns how many were removed.
    async fn clear_session(&self, session_key: &str) -> Result<usize, MemoryError>;

    /// Remove a session's contents, compaction cache, and index entry.
    /// Returns whether the session existed.
    async fn delete_session(&self, session_key: &str) -> Result<bool, MemoryError>;

    /// Set the user-chosen title in the session index, protecting it from
    /// auto-overwrite. Returns whether the session was found.
    async fn update_session_title(
        &self,
        session_key: &str,
        title: &str,
    ) -> Result<bool, MemoryError>;

    /// Word-overlap search across stored entries, deterministic ranking.
    async fn search(
        &self,
        query: Option<&str>,
        kind: Option<MemoryKind>,
        tags: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError>;

    // ── Alias table ──────────────────────────────────────────────────────────

    /// Single-hop alias resolution: `aliases[k]` if present, else `k`.
    async fn resolve_session_alias(&self, session_key: &str) -> Result<String, MemoryError>;

    async fn set_session_alias(
        &self,
        source_key: &str,
        target_key: &str,
    ) -> Result<(), MemoryError>;

    /// Returns whether an alias existed.
    async fn remove_session_alias(&self, source_key: &str) -> Result<bool, MemoryError>;

    /// All session keys associated with a base key: historical alias targets
    /// plus the base session itself when it has stored messages.
    async fn get_session_keys_for_chat(
        &self,
        source_key: &str,
    ) -> Result<Vec<String>, MemoryError>;

    /// Index metadata for one session, if present.
    async fn get_session_meta(
        &self,
        session_key: &str,
    ) -> Result<Option<SessionIndexEntry>, MemoryError>;

    // ── Compaction cache ─────────────────────────────────────────────────────

    async fn get_compaction_cache(
        &self,
        session_key: &str,
    ) -> Result<Option<CompactionCache>, MemoryError>;

    async fn put_compaction_cache(
        &self,
        session_key: &str,
        cache: &CompactionCache,
    ) -> Result<(), MemoryError>;

    // ── Optional capabilities ────────────────────────────────────────────────

    /// Extract facts from a conversation turn and merge them into long-term
    /// memory. Backends without native extraction return `Unsupported`.
    async fn auto_learn(
        &self,
        _messages: &[ChatMessage],
        _user_id: &str,
    ) -> Result<Vec<String>, MemoryError> {
        Err(MemoryError::Unsupported("auto_learn"))
    }

    /// Embedding-based retrieval returning `(text, score)` pairs, or `None`
    /// when the backend has no semantic index.
    async fn semantic_search(
        &self,
        _query: &str,
        _user_id: &str,
        _limit: usize,
    ) -> Option<Vec<(String, f32)>> {
        None
    }
}

// ─── SessionIndexEntry ────────────────────────────────────────────────────────

/// Metadata the store keeps per session in `_index.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub last_activity: String,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub preview: String,
    /// Set when the user renamed the session; protects `title` from
    /// auto-overwrite on subsequent appends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_title: Option<String>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_entry_carries_role_and_key() {
        let e = MemoryEntry::session("cli:a", Role::User, "hello");
        assert_eq!(e.kind, MemoryKind::Session);
        assert_eq!(e.role, Some(Role::User));
        assert_eq!(e.session_key.as_deref(), Some("cli:a"));
    }

    #[test]
    fn builders_populate_metadata() {
        let e = MemoryEntry::long_term("fact")
            .with_header("Preferences")
            .with_user_id("abc123");
        assert_eq!(e.meta_str("header"), Some("Preferences"));
        assert_eq!(e.meta_str("user_id"), Some("abc123"));
    }

    #[test]
    fn kind_serde_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&MemoryKind::LongTerm).unwrap(),
            "\"long_term\""
        );
    }
}
