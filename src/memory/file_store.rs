//! File-based memory store.
//!
//! Human-readable markdown for the long-term and daily tiers, JSON for
//! session logs:
//!
//! ```text
//! ~/.pocketpaw/memory/
//!   MEMORY.md                      ← owner long-term (## header = one entry)
//!   users/<user_id>/MEMORY.md      ← per-scoped-user long-term
//!   2026-07-30.md                  ← daily notes, one file per date
//!   sessions/
//!     telegram_42.json             ← ordered session log (safe_key form)
//!     telegram_42_compaction.json  ← {watermark, summary, older_count}
//!     _index.json                  ← session metadata index
//!     _aliases.json                ← alias table
//! ```
//!
//! Writes to session files, the index, and the alias table use temp-file +
//! rename so a crash never leaves a partial file. Blocking I/O runs on
//! `spawn_blocking`, off the task scheduler's critical path.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::types::{
    CompactionCache, MemoryEntry, MemoryError, MemoryKind, MemoryStore, Role, SessionIndexEntry,
};
use async_trait::async_trait;

// Words excluded from word-overlap search scoring.
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can", "to",
    "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "about", "like", "through",
    "after", "over", "between", "out", "against", "during", "without", "before", "under",
    "around", "among", "and", "but", "or", "nor", "not", "so", "yet", "both", "either", "neither",
    "each", "every", "all", "any", "few", "more", "most", "other", "some", "such", "no", "only",
    "own", "same", "than", "too", "very", "just", "because", "if", "when", "where", "how", "what",
    "which", "who", "whom", "this", "that", "these", "those", "i", "me", "my", "we", "our", "you",
    "your", "he", "him", "his", "she", "her", "it", "its", "they", "them", "their",
];

/// Filesystem-safe form of a session key: `:` and `/` become `_`.
pub fn safe_key(session_key: &str) -> String {
    session_key.replace([':', '/'], "_")
}

/// Deterministic UUIDv5 over path + header + body, so re-saving identical
/// content is a no-op.
fn deterministic_id(path: &Path, header: &str, body: &str) -> String {
    let name = format!("{}:{header}:{body}", path.display());
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()).to_string()
}

/// Lowercase, split on non-alphanumerics, strip stop words.
fn tokenize(text: &str) -> std::collections::HashSet<String> {
    let mut words: std::collections::HashSet<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect();
    for stop in STOP_WORDS {
        words.remove(*stop);
    }
    words
}

/// Truncate to at most `n` characters (not bytes).
fn truncate_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// On-disk shape of one session log item.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSessionMessage {
    id: String,
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

// ─── FileMemoryStore ──────────────────────────────────────────────────────────

pub struct FileMemoryStore {
    base_path: PathBuf,
    sessions_path: PathBuf,
    long_term_file: PathBuf,
    /// In-memory index of long-term and daily entries for fast search.
    index: RwLock<HashMap<String, MemoryEntry>>,
    /// Serializes appends per session key.
    session_write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes `_index.json` read-modify-write.
    session_index_lock: Mutex<()>,
    /// Serializes `_aliases.json` read-modify-write.
    alias_lock: Mutex<()>,
}

impl FileMemoryStore {
    /// Open (or create) a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let base_path = base_path.into();
        let sessions_path = base_path.join("sessions");
        fs::create_dir_all(&sessions_path)?;

        let store = Self {
            long_term_file: base_path.join("MEMORY.md"),
            base_path,
            sessions_path,
            index: RwLock::new(HashMap::new()),
            session_write_locks: Mutex::new(HashMap::new()),
            session_index_lock: Mutex::new(()),
            alias_lock: Mutex::new(()),
        };

        let entries = store.load_markdown_index()?;
        if let Ok(mut index) = store.index.try_write() {
            *index = entries;
        }

        // First run: build the session index from existing session files.
        if !store.index_path().exists() {
            store.rebuild_session_index()?;
        }

        Ok(store)
    }

    fn index_path(&self) -> PathBuf {
        self.sessions_path.join("_index.json")
    }

    fn aliases_path(&self) -> PathBuf {
        self.sessions_path.join("_aliases.json")
    }

    fn session_file(&self, session_key: &str) -> PathBuf {
        self.sessions_path.join(format!("{}.json", safe_key(session_key)))
    }

    fn compaction_file(&self, session_key: &str) -> PathBuf {
        self.sessions_path
            .join(format!("{}_compaction.json", safe_key(session_key)))
    }

    fn user_memory_file(&self, user_id: &str) -> Result<PathBuf, MemoryError> {
        if user_id == "default" {
            return Ok(self.long_term_file.clone());
        }
        let user_dir = self.base_path.join("users").join(user_id);
        fs::create_dir_all(&user_dir)?;
        Ok(user_dir.join("MEMORY.md"))
    }

    fn daily_file(&self) -> PathBuf {
        self.base_path
            .join(format!("{}.md", Utc::now().format("%Y-%m-%d")))
    }

    // ── Markdown index loading ───────────────────────────────────────────────

    fn load_markdown_index(&self) -> Result<HashMap<String, MemoryEntry>, MemoryError> {
        let mut index = HashMap::new();

        if self.long_term_file.exists() {
            Self::parse_markdown_file(&self.long_term_file, MemoryKind::LongTerm, "default", &mut index)?;
        }

        let users_dir = self.base_path.join("users");
        if users_dir.exists() {
            for entry in fs::read_dir(&users_dir)? {
                let dir = entry?.path();
                let mem = dir.join("MEMORY.md");
                if mem.exists()
                    && let Some(user_id) = dir.file_name().and_then(|n| n.to_str())
                {
                    Self::parse_markdown_file(&mem, MemoryKind::LongTerm, user_id, &mut index)?;
                }
            }
        }

        // All daily files, oldest first.
        let daily_re = Regex::new(r"^\d{4}-\d{2}-\d{2}\.md$").map_err(|e| MemoryError::Corrupt(e.to_string()))?;
        let mut daily_files: Vec<PathBuf> = fs::read_dir(&self.base_path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| daily_re.is_match(n))
            })
            .collect();
        daily_files.sort();
        for path in daily_files {
            Self::parse_markdown_file(&path, MemoryKind::Daily, "default", &mut index)?;
        }

        Ok(index)
    }

    /// Split a markdown file on `##` headers; one header section = one entry.
    /// A body may end with `#tag` words, which become the entry's tags.
    fn parse_markdown_file(
        path: &Path,
        kind: MemoryKind,
        user_id: &str,
        index: &mut HashMap<String, MemoryEntry>,
    ) -> Result<(), MemoryError> {
        let content = fs::read_to_string(path)?;
        for section in split_sections(&content) {
            let (header, body) = section;
            if body.is_empty() {
                continue;
            }
            let id = deterministic_id(path, &header, &body);
            let mut entry = match kind {
                MemoryKind::LongTerm => MemoryEntry::long_term(&body),
                _ => MemoryEntry::daily(&body),
            };
            entry.id = id.clone();
            entry.tags = extract_tags(&body);
            entry.metadata.insert(
                "header".to_owned(),
                serde_json::Value::String(header.clone()),
            );
            entry.metadata.insert(
                "source".to_owned(),
                serde_json::Value::String(path.display().to_string()),
            );
            if user_id != "default" {
                entry.metadata.insert(
                    "user_id".to_owned(),
                    serde_json::Value::String(user_id.to_owned()),
                );
            }
            index.insert(id, entry);
        }
        Ok(())
    }

    // ── Session index ────────────────────────────────────────────────────────

    fn load_session_index_sync(path: &Path) -> HashMap<String, SessionIndexEntry> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    async fn load_session_index(&self) -> HashMap<String, SessionIndexEntry> {
        let path = self.index_path();
        tokio::task::spawn_blocking(move || Self::load_session_index_sync(&path))
            .await
            .unwrap_or_default()
    }

    fn save_session_index_sync(
        path: &Path,
        index: &HashMap<String, SessionIndexEntry>,
    ) -> Result<(), MemoryError> {
        let raw = serde_json::to_string_pretty(index)
            .map_err(|e| MemoryError::Corrupt(e.to_string()))?;
        write_atomic(path, raw.as_bytes())
    }

    /// Full directory scan to build the index from existing session files.
    pub fn rebuild_session_index(&self) -> Result<HashMap<String, SessionIndexEntry>, MemoryError> {
        let mut index = HashMap::new();
        for entry in fs::read_dir(&self.sessions_path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json")
                || name.starts_with('_')
                || name.ends_with("_compaction.json")
            {
                continue;
            }
            let key = name.trim_end_matches(".json").to_owned();
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(messages) = serde_json::from_str::<Vec<StoredSessionMessage>>(&raw) else {
                continue;
            };
            if messages.is_empty() {
                continue;
            }
            let channel = key.split('_').next().unwrap_or("unknown").to_owned();
            index.insert(key.clone(), index_entry_for(channel, &messages, None));
        }
        Self::save_session_index_sync(&self.index_path(), &index)?;
        Ok(index)
    }

    async fn update_session_index_after_append(
        &self,
        session_key: &str,
        messages: &[StoredSessionMessage],
    ) -> Result<(), MemoryError> {
        let _guard = self.session_index_lock.lock().await;
        let path = self.index_path();
        let key = safe_key(session_key);
        let channel = session_key.split(':').next().unwrap_or("unknown").to_owned();
        let mut index = Self::load_session_index_sync(&path);
        let existing = index.get(&key).cloned();
        index.insert(key, index_entry_for(channel, messages, existing));
        tokio::task::spawn_blocking(move || Self::save_session_index_sync(&path, &index))
            .await
            .map_err(|e| MemoryError::Corrupt(e.to_string()))?
    }

    // ── Aliases ──────────────────────────────────────────────────────────────

    fn load_aliases_sync(path: &Path) -> HashMap<String, String> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save_aliases_sync(path: &Path, aliases: &HashMap<String, String>) -> Result<(), MemoryError> {
        let raw = serde_json::to_string_pretty(aliases)
            .map_err(|e| MemoryError::Corrupt(e.to_string()))?;
        write_atomic(path, raw.as_bytes())
    }

    // ── Session writes ───────────────────────────────────────────────────────

    async fn session_write_lock(&self, session_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_write_locks.lock().await;
        locks
            .entry(session_key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn append_session_entry(&self, entry: &MemoryEntry) -> Result<(), MemoryError> {
        let Some(session_key) = entry.session_key.clone() else {
            return Ok(());
        };

        let lock = self.session_write_lock(&session_key).await;
        let _guard = lock.lock().await;

        let path = self.session_file(&session_key);
        let stored = StoredSessionMessage {
            id: entry.id.clone(),
            role: entry.role.unwrap_or(Role::User),
            content: entry.content.clone(),
            timestamp: entry.created_at,
            metadata: entry.metadata.clone(),
        };

        let messages = tokio::task::spawn_blocking(move || -> Result<_, MemoryError> {
            let mut messages: Vec<StoredSessionMessage> = match fs::read_to_string(&path) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            messages.push(stored);
            let raw = serde_json::to_string_pretty(&messages)
                .map_err(|e| MemoryError::Corrupt(e.to_string()))?;
            write_atomic(&path, raw.as_bytes())?;
            Ok(messages)
        })
        .await
        .map_err(|e| MemoryError::Corrupt(e.to_string()))??;

        self.update_session_index_after_append(&session_key, &messages)
            .await
    }

    // ── Markdown writes ──────────────────────────────────────────────────────

    fn append_markdown(path: &Path, entry: &MemoryEntry) -> Result<(), MemoryError> {
        let header = entry
            .meta_str("header")
            .map(str::to_owned)
            .unwrap_or_else(|| Utc::now().format("%H:%M").to_string());
        let mut section = format!("\n\n## {header}\n\n{}", entry.content);
        if !entry.tags.is_empty() {
            let tags: Vec<String> = entry.tags.iter().map(|t| format!("#{t}")).collect();
            section.push_str(&format!("\n\n{}", tags.join(" ")));
        }
        use std::io::Write as _;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(section.as_bytes())?;
        Ok(())
    }

    /// Reconstruct a markdown file from the remaining index entries that
    /// point at it; removes the file when none are left.
    fn rewrite_markdown(
        path: &Path,
        index: &HashMap<String, MemoryEntry>,
    ) -> Result<(), MemoryError> {
        let source = path.display().to_string();
        let mut remaining: Vec<&MemoryEntry> = index
            .values()
            .filter(|e| e.meta_str("source") == Some(source.as_str()))
            .collect();
        if remaining.is_empty() {
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }
        remaining.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut parts = Vec::with_capacity(remaining.len());
        for e in remaining {
            let header = e.meta_str("header").unwrap_or("Memory");
            let mut section = format!("## {header}\n\n{}", e.content);
            if !e.tags.is_empty() {
                let tags: Vec<String> = e.tags.iter().map(|t| format!("#{t}")).collect();
                section.push_str(&format!("\n\n{}", tags.join(" ")));
            }
            parts.push(section);
        }
        fs::write(path, parts.join("\n\n") + "\n")?;
        Ok(())
    }
}

fn extract_tags(content: &str) -> Vec<String> {
    // #word tags, as written by hand or by `remember`.
    let re = match Regex::new(r"#(\w+)") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.captures_iter(content)
        .map(|c| c[1].to_owned())
        .collect()
}

/// Split markdown into `(header, body)` sections on `##`+ headers.
fn split_sections(content: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut header: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    let mut push = |header: &Option<String>, body: &[&str], out: &mut Vec<(String, String)>| {
        if let Some(h) = header {
            let text = body.join("\n").trim().to_owned();
            out.push((h.clone(), text));
        }
    };

    for line in content.lines() {
        if let Some(stripped) = line.strip_prefix("##") {
            push(&header, &body, &mut sections);
            header = Some(stripped.trim_start_matches('#').trim().to_owned());
            body.clear();
        } else if header.is_some() {
            body.push(line);
        }
    }
    push(&header, &body, &mut sections);
    sections
}

/// Derive the index entry for a session from its full message list,
/// preserving a user-chosen title from `existing`.
fn index_entry_for(
    channel: String,
    messages: &[StoredSessionMessage],
    existing: Option<SessionIndexEntry>,
) -> SessionIndexEntry {
    let auto_title = messages
        .iter()
        .find(|m| m.role == Role::User && !m.content.trim().is_empty())
        .map(|m| truncate_chars(m.content.trim(), 80))
        .unwrap_or_else(|| "New Chat".to_owned());

    let first = messages.first();
    let last = messages.last();
    let existing = existing.unwrap_or_default();

    let title = existing
        .user_title
        .clone()
        .unwrap_or(auto_title);

    SessionIndexEntry {
        title,
        channel,
        created: if existing.created.is_empty() {
            first.map(|m| m.timestamp.to_rfc3339()).unwrap_or_default()
        } else {
            existing.created
        },
        last_activity: last.map(|m| m.timestamp.to_rfc3339()).unwrap_or_default(),
        message_count: messages.len(),
        preview: last.map(|m| truncate_chars(&m.content, 120)).unwrap_or_default(),
        user_title: existing.user_title,
    }
}

/// Temp-file + rename write.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), MemoryError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ─── MemoryStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn save(&self, mut entry: MemoryEntry) -> Result<String, MemoryError> {
        if entry.kind == MemoryKind::Session {
            if entry.id.is_empty() {
                entry.id = Uuid::new_v4().to_string();
            }
            entry.updated_at = Utc::now();
            self.append_session_entry(&entry).await?;
            return Ok(entry.id);
        }

        // Long-term and daily: deterministic id over (target, header, body).
        let header = entry.meta_str("header").unwrap_or("Memory").to_owned();
        let target = match entry.kind {
            MemoryKind::LongTerm => {
                let user_id = entry.meta_str("user_id").unwrap_or("default").to_owned();
                self.user_memory_file(&user_id)?
            }
            _ => self.daily_file(),
        };
        let id = deterministic_id(&target, &header, &entry.content);

        {
            let index = self.index.read().await;
            if index.contains_key(&id) {
                return Ok(id); // exact duplicate, skip
            }
        }

        entry.id = id.clone();
        entry.metadata.insert(
            "source".to_owned(),
            serde_json::Value::String(target.display().to_string()),
        );
        entry.updated_at = Utc::now();

        let entry_for_disk = entry.clone();
        let target_clone = target.clone();
        tokio::task::spawn_blocking(move || Self::append_markdown(&target_clone, &entry_for_disk))
            .await
            .map_err(|e| MemoryError::Corrupt(e.to_string()))??;

        self.index.write().await.insert(id.clone(), entry);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        Ok(self.index.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        let mut index = self.index.write().await;
        let Some(entry) = index.remove(id) else {
            return Ok(false);
        };
        if let Some(source) = entry.meta_str("source") {
            Self::rewrite_markdown(Path::new(source), &index)?;
        }
        Ok(true)
    }

    async fn get_by_kind(
        &self,
        kind: MemoryKind,
        limit: usize,
        user_id: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let index = self.index.read().await;
        let mut results: Vec<MemoryEntry> = index
            .values()
            .filter(|e| e.kind == kind)
            .filter(|e| match (user_id, kind) {
                (Some(uid), MemoryKind::LongTerm) => {
                    e.meta_str("user_id").unwrap_or("default") == uid
                }
                _ => true,
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        results.truncate(limit);
        Ok(results)
    }

    async fn get_session(&self, session_key: &str) -> Result<Vec<MemoryEntry>, MemoryError> {
        let path = self.session_file(session_key);
        let key = session_key.to_owned();
        tokio::task::spawn_blocking(move || -> Result<Vec<MemoryEntry>, MemoryError> {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let messages: Vec<StoredSessionMessage> =
                serde_json::from_str(&raw).unwrap_or_default();
            Ok(messages
                .into_iter()
                .map(|m| {
                    let mut entry = MemoryEntry::session(&key, m.role, m.content);
                    entry.id = m.id;
                    entry.created_at = m.timestamp;
                    entry.updated_at = m.timestamp;
                    entry.metadata = m.metadata;
                    entry
                })
                .collect())
        })
        .await
        .map_err(|e| MemoryError::Corrupt(e.to_string()))?
    }

    async fn clear_session(&self, session_key: &str) -> Result<usize, MemoryError> {
        let path = self.session_file(session_key);
        let count = tokio::task::spawn_blocking(move || -> Result<usize, MemoryError> {
            if !path.exists() {
                return Ok(0);
            }
            let count = fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Vec<StoredSessionMessage>>(&raw).ok())
                .map(|m| m.len())
                .unwrap_or(0);
            fs::remove_file(&path)?;
            Ok(count)
        })
        .await
        .map_err(|e| MemoryError::Corrupt(e.to_string()))??;

        // An empty session has no index entry.
        if count > 0 {
            let _guard = self.session_index_lock.lock().await;
            let index_path = self.index_path();
            let mut index = Self::load_session_index_sync(&index_path);
            if index.remove(&safe_key(session_key)).is_some() {
                Self::save_session_index_sync(&index_path, &index)?;
            }
        }
        Ok(count)
    }

    async fn delete_session(&self, session_key: &str) -> Result<bool, MemoryError> {
        let session_file = self.session_file(session_key);
        if !session_file.exists() {
            return Ok(false);
        }
        fs::remove_file(&session_file)?;
        let compaction = self.compaction_file(session_key);
        if compaction.exists() {
            fs::remove_file(&compaction)?;
        }

        {
            let _guard = self.session_index_lock.lock().await;
            let path = self.index_path();
            let mut index = Self::load_session_index_sync(&path);
            index.remove(&safe_key(session_key));
            Self::save_session_index_sync(&path, &index)?;
        }

        self.session_write_locks.lock().await.remove(session_key);
        Ok(true)
    }

    async fn update_session_title(
        &self,
        session_key: &str,
        title: &str,
    ) -> Result<bool, MemoryError> {
        let _guard = self.session_index_lock.lock().await;
        let path = self.index_path();
        let mut index = Self::load_session_index_sync(&path);
        let Some(entry) = index.get_mut(&safe_key(session_key)) else {
            return Ok(false);
        };
        entry.title = title.to_owned();
        entry.user_title = Some(title.to_owned());
        Self::save_session_index_sync(&path, &index)?;
        Ok(true)
    }

    async fn search(
        &self,
        query: Option<&str>,
        kind: Option<MemoryKind>,
        tags: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let query_words = query.map(tokenize).unwrap_or_default();
        let index = self.index.read().await;

        let mut candidates: Vec<(f64, &MemoryEntry)> = Vec::new();
        for entry in index.values() {
            if let Some(k) = kind
                && entry.kind != k
            {
                continue;
            }
            if let Some(tags) = tags
                && !tags.iter().any(|t| entry.tags.contains(t))
            {
                continue;
            }

            let score = if query_words.is_empty() {
                0.0
            } else {
                let mut content_words = tokenize(&entry.content);
                if let Some(header) = entry.meta_str("header") {
                    content_words.extend(tokenize(header));
                }
                let overlap = query_words.intersection(&content_words).count();
                if overlap == 0 {
                    continue;
                }
                overlap as f64 / query_words.len() as f64
            };
            candidates.push((score, entry));
        }

        // Score descending, id ascending for a deterministic ranking.
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    // ── Aliases ──────────────────────────────────────────────────────────────

    async fn resolve_session_alias(&self, session_key: &str) -> Result<String, MemoryError> {
        let _guard = self.alias_lock.lock().await;
        let aliases = Self::load_aliases_sync(&self.aliases_path());
        Ok(aliases
            .get(session_key)
            .cloned()
            .unwrap_or_else(|| session_key.to_owned()))
    }

    async fn set_session_alias(
        &self,
        source_key: &str,
        target_key: &str,
    ) -> Result<(), MemoryError> {
        let _guard = self.alias_lock.lock().await;
        let path = self.aliases_path();
        let mut aliases = Self::load_aliases_sync(&path);
        aliases.insert(source_key.to_owned(), target_key.to_owned());
        Self::save_aliases_sync(&path, &aliases)
    }

    async fn remove_session_alias(&self, source_key: &str) -> Result<bool, MemoryError> {
        let _guard = self.alias_lock.lock().await;
        let path = self.aliases_path();
        let mut aliases = Self::load_aliases_sync(&path);
        if aliases.remove(source_key).is_none() {
            return Ok(false);
        }
        Self::save_aliases_sync(&path, &aliases)?;
        Ok(true)
    }

    async fn get_session_keys_for_chat(
        &self,
        source_key: &str,
    ) -> Result<Vec<String>, MemoryError> {
        let aliases = {
            let _guard = self.alias_lock.lock().await;
            Self::load_aliases_sync(&self.aliases_path())
        };

        let mut keys: Vec<String> = aliases
            .iter()
            .filter(|(src, _)| src.as_str() == source_key)
            .map(|(_, tgt)| tgt.clone())
            .collect();

        // The unaliased base session counts when it has stored messages.
        if self.session_file(source_key).exists() && !keys.contains(&source_key.to_owned()) {
            keys.push(source_key.to_owned());
        }
        Ok(keys)
    }

    async fn get_session_meta(
        &self,
        session_key: &str,
    ) -> Result<Option<SessionIndexEntry>, MemoryError> {
        let index = self.load_session_index().await;
        Ok(index.get(&safe_key(session_key)).cloned())
    }

    // ── Compaction cache ─────────────────────────────────────────────────────

    async fn get_compaction_cache(
        &self,
        session_key: &str,
    ) -> Result<Option<CompactionCache>, MemoryError> {
        let path = self.compaction_file(session_key);
        tokio::task::spawn_blocking(move || match fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
        .map_err(|e| MemoryError::Corrupt(e.to_string()))?
    }

    async fn put_compaction_cache(
        &self,
        session_key: &str,
        cache: &CompactionCache,
    ) -> Result<(), MemoryError> {
        let path = self.compaction_file(session_key);
        let raw = serde_json::to_string_pretty(cache)
            .map_err(|e| MemoryError::Corrupt(e.to_string()))?;
        tokio::task::spawn_blocking(move || write_atomic(&path, raw.as_bytes()))
            .await
            .map_err(|e| MemoryError::Corrupt(e.to_string()))?
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FileMemoryStore) {
        let dir = TempDir::new().unwrap();
        let store = FileMemoryStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn safe_key_replaces_separators() {
        assert_eq!(safe_key("telegram:42/7"), "telegram_42_7");
    }

    #[tokio::test]
    async fn long_term_save_is_deduplicated() {
        let (_dir, store) = store().await;
        let entry = MemoryEntry::long_term("User prefers dark mode").with_header("Preferences");
        let id1 = store.save(entry.clone()).await.unwrap();
        let id2 = store.save(entry).await.unwrap();
        assert_eq!(id1, id2, "identical content yields the same id");

        let all = store
            .get_by_kind(MemoryKind::LongTerm, 100, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn long_term_persists_as_markdown_sections() {
        let (dir, store) = store().await;
        store
            .save(
                MemoryEntry::long_term("Lives in Berlin #location")
                    .with_header("Home"),
            )
            .await
            .unwrap();

        let raw = fs::read_to_string(dir.path().join("MEMORY.md")).unwrap();
        assert!(raw.contains("## Home"));
        assert!(raw.contains("Lives in Berlin"));

        // A fresh store re-parses the file, including tags.
        let reopened = FileMemoryStore::new(dir.path()).unwrap();
        let all = reopened
            .get_by_kind(MemoryKind::LongTerm, 10, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].tags.contains(&"location".to_owned()));
    }

    #[tokio::test]
    async fn user_scoped_long_term_lands_in_user_dir() {
        let (dir, store) = store().await;
        store
            .save(
                MemoryEntry::long_term("external fact")
                    .with_header("Note")
                    .with_user_id("abcd1234"),
            )
            .await
            .unwrap();

        assert!(dir.path().join("users/abcd1234/MEMORY.md").exists());

        let scoped = store
            .get_by_kind(MemoryKind::LongTerm, 10, Some("abcd1234"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        let default = store
            .get_by_kind(MemoryKind::LongTerm, 10, Some("default"))
            .await
            .unwrap();
        assert!(default.is_empty());
    }

    #[tokio::test]
    async fn session_appends_preserve_order() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            store
                .save(MemoryEntry::session("cli:a", Role::User, format!("m{i}")))
                .await
                .unwrap();
        }
        let log = store.get_session("cli:a").await.unwrap();
        let contents: Vec<&str> = log.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn session_index_tracks_title_count_preview() {
        let (_dir, store) = store().await;
        store
            .save(MemoryEntry::session("cli:a", Role::User, "What is Rust?"))
            .await
            .unwrap();
        store
            .save(MemoryEntry::session("cli:a", Role::Assistant, "A systems language."))
            .await
            .unwrap();

        let meta = store.get_session_meta("cli:a").await.unwrap().unwrap();
        assert_eq!(meta.title, "What is Rust?");
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.preview, "A systems language.");
        assert_eq!(meta.channel, "cli");
    }

    #[tokio::test]
    async fn user_title_survives_later_appends() {
        let (_dir, store) = store().await;
        store
            .save(MemoryEntry::session("cli:a", Role::User, "first"))
            .await
            .unwrap();
        assert!(store.update_session_title("cli:a", "My Project").await.unwrap());

        store
            .save(MemoryEntry::session("cli:a", Role::User, "second"))
            .await
            .unwrap();
        let meta = store.get_session_meta("cli:a").await.unwrap().unwrap();
        assert_eq!(meta.title, "My Project");
    }

    #[tokio::test]
    async fn delete_session_removes_everything() {
        let (_dir, store) = store().await;
        store
            .save(MemoryEntry::session("cli:a", Role::User, "hi"))
            .await
            .unwrap();
        store
            .put_compaction_cache(
                "cli:a",
                &CompactionCache {
                    watermark: 1,
                    summary: "s".into(),
                    older_count: 0,
                },
            )
            .await
            .unwrap();

        assert!(store.delete_session("cli:a").await.unwrap());
        assert!(store.get_session("cli:a").await.unwrap().is_empty());
        assert!(store.get_session_meta("cli:a").await.unwrap().is_none());
        assert!(store.get_compaction_cache("cli:a").await.unwrap().is_none());
        assert!(!store.delete_session("cli:a").await.unwrap(), "second delete is false");
    }

    #[tokio::test]
    async fn clear_session_returns_count_and_drops_index_entry() {
        let (_dir, store) = store().await;
        for _ in 0..3 {
            store
                .save(MemoryEntry::session("cli:a", Role::User, "x"))
                .await
                .unwrap();
        }
        assert_eq!(store.clear_session("cli:a").await.unwrap(), 3);
        assert_eq!(store.clear_session("cli:a").await.unwrap(), 0);
        // Index entries exist only for sessions with stored messages.
        assert!(store.get_session_meta("cli:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn alias_resolution_is_single_hop() {
        let (_dir, store) = store().await;
        store.set_session_alias("a", "b").await.unwrap();
        store.set_session_alias("b", "c").await.unwrap();
        // resolve(a) → b, never chained to c.
        assert_eq!(store.resolve_session_alias("a").await.unwrap(), "b");
        assert_eq!(store.resolve_session_alias("b").await.unwrap(), "c");
        assert_eq!(store.resolve_session_alias("zzz").await.unwrap(), "zzz");
    }

    #[tokio::test]
    async fn session_keys_for_chat_includes_base_when_populated() {
        let (_dir, store) = store().await;
        store
            .save(MemoryEntry::session("telegram:42", Role::User, "base msg"))
            .await
            .unwrap();
        store
            .set_session_alias("telegram:42", "telegram:42:deadbeef")
            .await
            .unwrap();
        store
            .save(MemoryEntry::session("telegram:42:deadbeef", Role::User, "aliased"))
            .await
            .unwrap();

        let keys = store.get_session_keys_for_chat("telegram:42").await.unwrap();
        assert!(keys.contains(&"telegram:42".to_owned()));
        assert!(keys.contains(&"telegram:42:deadbeef".to_owned()));
    }

    #[tokio::test]
    async fn search_ranks_by_word_overlap() {
        let (_dir, store) = store().await;
        store
            .save(MemoryEntry::long_term("Rust borrow checker rules").with_header("A"))
            .await
            .unwrap();
        store
            .save(MemoryEntry::long_term("Gardening tips for spring").with_header("B"))
            .await
            .unwrap();

        let hits = store
            .search(Some("rust borrow"), None, None, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("borrow checker"));
    }

    #[tokio::test]
    async fn stop_words_do_not_contribute_to_matching() {
        let (_dir, store) = store().await;
        store
            .save(MemoryEntry::long_term("the cat sat quietly").with_header("A"))
            .await
            .unwrap();
        store
            .save(MemoryEntry::long_term("the dog ran away").with_header("B"))
            .await
            .unwrap();

        // "the" is filtered; only "cat" carries signal.
        let hits = store.search(Some("the cat"), None, None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("cat"));
    }

    #[tokio::test]
    async fn delete_rewrites_markdown_file() {
        let (dir, store) = store().await;
        let id_keep = store
            .save(MemoryEntry::long_term("keep me").with_header("Keep"))
            .await
            .unwrap();
        let id_drop = store
            .save(MemoryEntry::long_term("drop me").with_header("Drop"))
            .await
            .unwrap();

        assert!(store.delete(&id_drop).await.unwrap());
        let raw = fs::read_to_string(dir.path().join("MEMORY.md")).unwrap();
        assert!(raw.contains("keep me"));
        assert!(!raw.contains("drop me"));
        assert!(store.get(&id_keep).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_session_do_not_lose_messages() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save(MemoryEntry::session("slack:c", Role::User, format!("n{i}")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let log = store.get_session("slack:c").await.unwrap();
        assert_eq!(log.len(), 10, "per-session lock prevents lost appends");
    }

    #[tokio::test]
    async fn rebuild_session_index_scans_existing_files() {
        let (dir, store) = store().await;
        store
            .save(MemoryEntry::session("cli:x", Role::User, "seed"))
            .await
            .unwrap();
        // Simulate an index lost between runs.
        fs::remove_file(dir.path().join("sessions/_index.json")).unwrap();
        let reopened = FileMemoryStore::new(dir.path()).unwrap();
        let meta = reopened.get_session_meta("cli:x").await.unwrap();
        assert!(meta.is_some(), "index rebuilt from session files");
    }
}
