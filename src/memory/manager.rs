//! `MemoryManager` — the high-level facade over a [`MemoryStore`].
//!
//! Adds what the raw store does not know about: sender→scope mapping,
//! prompt-ready context blocks, two-tier history compaction, session
//! listings, and LLM-assisted auto-learn for backends without native
//! extraction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::CompactionConfig;

use super::types::{
    ChatMessage, CompactionCache, MemoryEntry, MemoryError, MemoryKind, MemoryStore, Role,
    SessionSummary,
};

/// Produces the Tier-2 compaction summary (2–3 sentences over a transcript).
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String, String>;
}

/// Extracts long-term facts from a conversation turn.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract_facts(&self, transcript: &str) -> Result<Vec<String>, String>;
}

/// Map a sender to its memory scope.
///
/// - no owner configured, or sender is the owner → `"default"`
/// - otherwise → first 16 hex chars of `SHA-256(sender_id)`
pub fn resolve_user_id(owner_id: Option<&str>, sender_id: Option<&str>) -> String {
    let Some(sender) = sender_id else {
        return "default".to_owned();
    };
    let Some(owner) = owner_id else {
        return "default".to_owned();
    };
    if sender == owner {
        return "default".to_owned();
    }
    let digest = Sha256::digest(sender.as_bytes());
    hex::encode(digest)[..16].to_owned()
}

// ─── MemoryManager ────────────────────────────────────────────────────────────

pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    owner_id: Option<String>,
    summarizer: Option<Arc<dyn Summarizer>>,
    fact_extractor: Option<Arc<dyn FactExtractor>>,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, owner_id: Option<String>) -> Self {
        Self {
            store,
            owner_id,
            summarizer: None,
            fact_extractor: None,
        }
    }

    /// Attach the Tier-2 summarizer used when `llm_summarize` is enabled.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Attach the fact extractor used for file-backend auto-learn.
    pub fn with_fact_extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.fact_extractor = Some(extractor);
        self
    }

    fn scope_for(&self, sender_id: Option<&str>) -> String {
        resolve_user_id(self.owner_id.as_deref(), sender_id)
    }

    // ── High-level operations ────────────────────────────────────────────────

    /// Store a long-term memory, scoped to the sender.
    pub async fn remember(
        &self,
        content: &str,
        tags: Vec<String>,
        header: Option<&str>,
        sender_id: Option<&str>,
    ) -> Result<String, MemoryError> {
        let entry = MemoryEntry::long_term(content)
            .with_tags(tags)
            .with_header(header.unwrap_or("Memory"))
            .with_user_id(self.scope_for(sender_id));
        self.store.save(entry).await
    }

    /// Add a daily note (globally scoped).
    pub async fn note(&self, content: &str, tags: Vec<String>) -> Result<String, MemoryError> {
        let entry = MemoryEntry::daily(content)
            .with_tags(tags)
            .with_header(chrono::Utc::now().format("%H:%M").to_string());
        self.store.save(entry).await
    }

    /// Append one message to a session log.
    pub async fn add_to_session(
        &self,
        session_key: &str,
        role: Role,
        content: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<String, MemoryError> {
        let entry = MemoryEntry::session(session_key, role, content).with_metadata(metadata);
        self.store.save(entry).await
    }

    /// The last `limit` session messages in prompt shape.
    pub async fn get_session_history(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, MemoryError> {
        let entries = self.store.get_session(session_key).await?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries
            .into_iter()
            .skip(skip)
            .map(|e| ChatMessage::new(e.role.unwrap_or(Role::User), e.content))
            .collect())
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        self.store.search(Some(query), None, None, limit).await
    }

    /// Delete a long-term/daily entry by id (the `forget` tool path).
    pub async fn forget(&self, id: &str) -> Result<bool, MemoryError> {
        self.store.delete(id).await
    }

    // ── Context blocks ───────────────────────────────────────────────────────

    /// The standard memory block for the system prompt: scoped long-term
    /// entries plus today's notes, capped at `max_chars`.
    pub async fn get_context_for_agent(
        &self,
        sender_id: Option<&str>,
    ) -> Result<String, MemoryError> {
        const MAX_CHARS: usize = 8000;
        const LONG_TERM_LIMIT: usize = 50;
        const DAILY_LIMIT: usize = 20;
        const ENTRY_MAX_CHARS: usize = 500;

        let user_id = self.scope_for(sender_id);
        let mut parts: Vec<String> = Vec::new();

        let long_term = self
            .store
            .get_by_kind(MemoryKind::LongTerm, LONG_TERM_LIMIT, Some(&user_id))
            .await?;
        if !long_term.is_empty() {
            parts.push("## Long-term Memory\n".to_owned());
            for entry in &long_term {
                parts.push(format!("- {}", truncate_chars(&entry.content, ENTRY_MAX_CHARS)));
            }
        }

        let daily = self
            .store
            .get_by_kind(MemoryKind::Daily, DAILY_LIMIT, None)
            .await?;
        if !daily.is_empty() {
            parts.push("\n## Today's Notes\n".to_owned());
            for entry in &daily {
                parts.push(format!("- {}", truncate_chars(&entry.content, ENTRY_MAX_CHARS)));
            }
        }

        let mut context = parts.join("\n");
        if context.chars().count() > MAX_CHARS {
            context = truncate_chars(&context, MAX_CHARS) + "\n...(truncated)";
        }
        Ok(context)
    }

    /// Semantically relevant context for the current query, when the store
    /// supports it; falls back to the standard block.
    pub async fn get_semantic_context(
        &self,
        query: &str,
        sender_id: Option<&str>,
    ) -> Result<String, MemoryError> {
        let user_id = self.scope_for(sender_id);
        if let Some(results) = self.store.semantic_search(query, &user_id, 5).await
            && !results.is_empty()
        {
            let mut parts = vec!["## Relevant Memories\n".to_owned()];
            for (text, _score) in results {
                parts.push(format!("- {text}"));
            }
            return Ok(parts.join("\n"));
        }
        self.get_context_for_agent(sender_id).await
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    /// Session history bounded by `cfg.char_budget`: the last
    /// `cfg.recent_window` messages verbatim, preceded by a summary block of
    /// everything older (LLM Tier 2 when enabled and cached fresh, else
    /// Tier-1 one-liner extracts).
    pub async fn get_compacted_history(
        &self,
        session_key: &str,
        cfg: &CompactionConfig,
    ) -> Result<Vec<ChatMessage>, MemoryError> {
        let entries = self.store.get_session(session_key).await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let all: Vec<ChatMessage> = entries
            .into_iter()
            .map(|e| ChatMessage::new(e.role.unwrap_or(Role::User), e.content))
            .collect();

        let split = all.len().saturating_sub(cfg.recent_window);
        let (older, recent) = all.split_at(split);
        if older.is_empty() {
            return Ok(enforce_budget(recent.to_vec(), cfg.char_budget));
        }

        let summary_block = if cfg.llm_summarize {
            self.tier2_summary(session_key, older, all.len()).await
        } else {
            None
        };
        let summary_block = summary_block.unwrap_or_else(|| tier1_summary(older, cfg.summary_chars));

        let mut compacted = vec![ChatMessage::new(
            Role::User,
            format!("[Earlier conversation]\n{summary_block}"),
        )];
        compacted.extend_from_slice(recent);
        Ok(enforce_budget(compacted, cfg.char_budget))
    }

    /// Cached-or-fresh LLM summary of the older messages. `None` on any
    /// failure — the caller falls back to Tier 1.
    async fn tier2_summary(
        &self,
        session_key: &str,
        older: &[ChatMessage],
        watermark: usize,
    ) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;

        if let Ok(Some(cache)) = self.store.get_compaction_cache(session_key).await
            && cache.watermark == watermark
        {
            return Some(cache.summary);
        }

        let mut transcript = older
            .iter()
            .map(|m| format!("{}: {}", capitalize(m.role.as_str()), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        if transcript.chars().count() > 4000 {
            transcript = truncate_chars(&transcript, 4000);
        }

        match summarizer.summarize(&transcript).await {
            Ok(summary) => {
                let cache = CompactionCache {
                    watermark,
                    summary: summary.clone(),
                    older_count: older.len(),
                };
                if let Err(e) = self.store.put_compaction_cache(session_key, &cache).await {
                    log::debug!("failed to cache compaction summary: {e}");
                }
                Some(summary)
            }
            Err(e) => {
                log::debug!("LLM summary failed, falling back to tier 1: {e}");
                None
            }
        }
    }

    // ── Auto-learn ───────────────────────────────────────────────────────────

    /// Extract facts from a conversation turn into long-term memory.
    ///
    /// Stores with native extraction handle it themselves; otherwise the
    /// attached [`FactExtractor`] runs and each fact is saved via
    /// [`remember`](Self::remember). Returns the number of facts learned.
    pub async fn auto_learn(
        &self,
        messages: &[ChatMessage],
        sender_id: Option<&str>,
    ) -> Result<usize, MemoryError> {
        let user_id = self.scope_for(sender_id);
        match self.store.auto_learn(messages, &user_id).await {
            Ok(facts) => return Ok(facts.len()),
            Err(MemoryError::Unsupported(_)) => {}
            Err(e) => return Err(e),
        }

        let Some(extractor) = self.fact_extractor.as_ref() else {
            return Ok(0);
        };
        let mut transcript = messages
            .iter()
            .map(|m| format!("{}: {}", capitalize(m.role.as_str()), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        if transcript.chars().count() > 4000 {
            transcript = truncate_chars(&transcript, 4000);
        }

        let facts = extractor
            .extract_facts(&transcript)
            .await
            .map_err(MemoryError::Corrupt)?;
        let mut saved = 0;
        for fact in facts {
            let fact = fact.trim();
            if fact.is_empty() {
                continue;
            }
            self.remember(fact, vec!["auto-learned".to_owned()], None, sender_id)
                .await?;
            saved += 1;
        }
        Ok(saved)
    }

    // ── Sessions & aliases ───────────────────────────────────────────────────

    pub async fn clear_session(&self, session_key: &str) -> Result<usize, MemoryError> {
        self.store.clear_session(session_key).await
    }

    pub async fn delete_session(&self, session_key: &str) -> Result<bool, MemoryError> {
        self.store.delete_session(session_key).await
    }

    pub async fn update_session_title(
        &self,
        session_key: &str,
        title: &str,
    ) -> Result<bool, MemoryError> {
        self.store.update_session_title(session_key, title).await
    }

    pub async fn resolve_session_key(&self, session_key: &str) -> Result<String, MemoryError> {
        self.store.resolve_session_alias(session_key).await
    }

    pub async fn set_session_alias(
        &self,
        source_key: &str,
        target_key: &str,
    ) -> Result<(), MemoryError> {
        self.store.set_session_alias(source_key, target_key).await
    }

    pub async fn remove_session_alias(&self, source_key: &str) -> Result<bool, MemoryError> {
        self.store.remove_session_alias(source_key).await
    }

    /// All sessions associated with a chat, most recent first, with the
    /// currently aliased target marked active.
    pub async fn list_sessions_for_chat(
        &self,
        session_key: &str,
    ) -> Result<Vec<SessionSummary>, MemoryError> {
        let keys = self.store.get_session_keys_for_chat(session_key).await?;
        let active_key = self.store.resolve_session_alias(session_key).await?;

        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let meta = self.store.get_session_meta(&key).await?.unwrap_or_default();
            sessions.push(SessionSummary {
                is_active: key == active_key,
                session_key: key,
                title: if meta.title.is_empty() {
                    "New Chat".to_owned()
                } else {
                    meta.title
                },
                last_activity: meta.last_activity,
                message_count: meta.message_count,
                preview: meta.preview,
            });
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }
}

// ─── Compaction helpers ───────────────────────────────────────────────────────

/// One line per older message, truncated to `summary_chars` at a word
/// boundary.
fn tier1_summary(older: &[ChatMessage], summary_chars: usize) -> String {
    older
        .iter()
        .map(|m| {
            let text = m.content.replace('\n', " ");
            let text = text.trim();
            let text = if text.chars().count() > summary_chars {
                let head = truncate_chars(text, summary_chars);
                let cut = head.rfind(' ').map(|i| &head[..i]).unwrap_or(&head);
                format!("{cut}...")
            } else {
                text.to_owned()
            };
            format!("{}: {text}", capitalize(m.role.as_str()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop from the front until the total content length fits `char_budget`;
/// if a single remaining message still exceeds it, truncate that message.
fn enforce_budget(messages: Vec<ChatMessage>, char_budget: usize) -> Vec<ChatMessage> {
    let total: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    if total <= char_budget {
        return messages;
    }

    let mut result = messages;
    while result.len() > 1
        && result.iter().map(|m| m.content.chars().count()).sum::<usize>() > char_budget
    {
        result.remove(0);
    }
    if let Some(first) = result.first_mut()
        && first.content.chars().count() > char_budget
    {
        first.content = truncate_chars(&first.content, char_budget);
    }
    result
}

fn truncate_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::file_store::FileMemoryStore;
    use tempfile::TempDir;

    fn manager_with(owner: Option<&str>) -> (TempDir, MemoryManager) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMemoryStore::new(dir.path()).unwrap());
        (dir, MemoryManager::new(store, owner.map(str::to_owned)))
    }

    fn cfg(recent_window: usize, char_budget: usize) -> CompactionConfig {
        CompactionConfig {
            recent_window,
            char_budget,
            summary_chars: 30,
            llm_summarize: false,
        }
    }

    // ── Scoping ──────────────────────────────────────────────────────────────

    #[test]
    fn scope_defaults_without_owner() {
        assert_eq!(resolve_user_id(None, Some("anyone")), "default");
        assert_eq!(resolve_user_id(None, None), "default");
    }

    #[test]
    fn scope_owner_maps_to_default() {
        assert_eq!(resolve_user_id(Some("o1"), Some("o1")), "default");
    }

    #[test]
    fn scope_external_sender_is_hashed() {
        let scope = resolve_user_id(Some("o1"), Some("stranger"));
        assert_eq!(scope.len(), 16);
        assert!(scope.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(scope, resolve_user_id(Some("o1"), Some("stranger")));
        assert_ne!(scope, resolve_user_id(Some("o1"), Some("other")));
    }

    #[tokio::test]
    async fn remember_scopes_by_sender() {
        let (_dir, mgr) = manager_with(Some("owner"));
        mgr.remember("owner fact", vec![], None, Some("owner")).await.unwrap();
        mgr.remember("guest fact", vec![], None, Some("guest")).await.unwrap();

        let owner_ctx = mgr.get_context_for_agent(Some("owner")).await.unwrap();
        assert!(owner_ctx.contains("owner fact"));
        assert!(!owner_ctx.contains("guest fact"));

        let guest_ctx = mgr.get_context_for_agent(Some("guest")).await.unwrap();
        assert!(guest_ctx.contains("guest fact"));
        assert!(!guest_ctx.contains("owner fact"));
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn compaction_keeps_recent_window_verbatim() {
        let (_dir, mgr) = manager_with(None);
        for i in 0..8 {
            mgr.add_to_session("cli:a", Role::User, &format!("message number {i}"), HashMap::new())
                .await
                .unwrap();
        }

        let history = mgr.get_compacted_history("cli:a", &cfg(3, 8000)).await.unwrap();
        // Summary block + 3 recent.
        assert_eq!(history.len(), 4);
        assert!(history[0].content.starts_with("[Earlier conversation]"));
        assert_eq!(history[1].content, "message number 5");
        assert_eq!(history[3].content, "message number 7");
    }

    #[tokio::test]
    async fn compaction_without_older_messages_is_verbatim() {
        let (_dir, mgr) = manager_with(None);
        mgr.add_to_session("cli:a", Role::User, "only one", HashMap::new())
            .await
            .unwrap();
        let history = mgr.get_compacted_history("cli:a", &cfg(10, 8000)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "only one");
    }

    #[tokio::test]
    async fn compaction_respects_char_budget() {
        let (_dir, mgr) = manager_with(None);
        for i in 0..6 {
            let long = format!("{i}-{}", "x".repeat(400));
            mgr.add_to_session("cli:a", Role::User, &long, HashMap::new())
                .await
                .unwrap();
        }
        let history = mgr.get_compacted_history("cli:a", &cfg(4, 900)).await.unwrap();
        let total: usize = history.iter().map(|m| m.content.chars().count()).sum();
        assert!(total <= 900, "total {total} exceeds budget");
    }

    #[test]
    fn enforce_budget_truncates_single_oversized_message() {
        let messages = vec![ChatMessage::new(Role::User, "y".repeat(100))];
        let result = enforce_budget(messages, 10);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].content.chars().count(), 10);
    }

    #[test]
    fn tier1_truncates_at_word_boundary() {
        let older = vec![ChatMessage::new(
            Role::User,
            "alpha beta gamma delta epsilon zeta eta theta",
        )];
        let summary = tier1_summary(&older, 20);
        assert!(summary.starts_with("User: "));
        assert!(summary.ends_with("..."));
        assert!(!summary.contains("theta"));
    }

    #[tokio::test]
    async fn tier2_uses_cache_when_watermark_matches() {
        struct CountingSummarizer(std::sync::atomic::AtomicUsize);

        #[async_trait]
        impl Summarizer for CountingSummarizer {
            async fn summarize(&self, _t: &str) -> Result<String, String> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok("the gist".to_owned())
            }
        }

        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMemoryStore::new(dir.path()).unwrap());
        let summarizer = Arc::new(CountingSummarizer(std::sync::atomic::AtomicUsize::new(0)));
        let mgr = MemoryManager::new(store, None).with_summarizer(summarizer.clone());

        for i in 0..6 {
            mgr.add_to_session("cli:a", Role::User, &format!("m{i}"), HashMap::new())
                .await
                .unwrap();
        }
        let cfg = CompactionConfig {
            recent_window: 2,
            char_budget: 8000,
            summary_chars: 150,
            llm_summarize: true,
        };
        let h1 = mgr.get_compacted_history("cli:a", &cfg).await.unwrap();
        let h2 = mgr.get_compacted_history("cli:a", &cfg).await.unwrap();
        assert!(h1[0].content.contains("the gist"));
        assert_eq!(h1[0].content, h2[0].content);
        assert_eq!(
            summarizer.0.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "second call hits the cache"
        );
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_sessions_marks_active_and_sorts() {
        let (_dir, mgr) = manager_with(None);
        mgr.add_to_session("telegram:42", Role::User, "base", HashMap::new())
            .await
            .unwrap();
        mgr.set_session_alias("telegram:42", "telegram:42:aaaa1111")
            .await
            .unwrap();
        mgr.add_to_session("telegram:42:aaaa1111", Role::User, "newer", HashMap::new())
            .await
            .unwrap();

        let sessions = mgr.list_sessions_for_chat("telegram:42").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_key, "telegram:42:aaaa1111");
        assert!(sessions[0].is_active);
        assert!(!sessions[1].is_active);
    }

    // ── Auto-learn ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn auto_learn_without_extractor_is_a_noop() {
        let (_dir, mgr) = manager_with(None);
        let learned = mgr
            .auto_learn(&[ChatMessage::new(Role::User, "hi")], None)
            .await
            .unwrap();
        assert_eq!(learned, 0);
    }

    #[tokio::test]
    async fn auto_learn_saves_extracted_facts() {
        struct FixedExtractor;

        #[async_trait]
        impl FactExtractor for FixedExtractor {
            async fn extract_facts(&self, _t: &str) -> Result<Vec<String>, String> {
                Ok(vec!["Likes espresso".to_owned(), "  ".to_owned()])
            }
        }

        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMemoryStore::new(dir.path()).unwrap());
        let mgr = MemoryManager::new(store, None).with_fact_extractor(Arc::new(FixedExtractor));

        let learned = mgr
            .auto_learn(
                &[
                    ChatMessage::new(Role::User, "I love espresso"),
                    ChatMessage::new(Role::Assistant, "Noted!"),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(learned, 1, "blank facts are skipped");

        let ctx = mgr.get_context_for_agent(None).await.unwrap();
        assert!(ctx.contains("Likes espresso"));
    }
}
