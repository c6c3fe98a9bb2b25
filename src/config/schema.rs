//! TOML configuration schema.
//!
//! All fields carry `#[serde(default)]`-compatible defaults so a partial
//! `~/.pocketpaw/config.toml` works; missing keys fall back to the values
//! below.
//!
//! Example:
//! ```toml
//! max_concurrent_conversations = 5
//! agent_backend = "native"
//! model = "claude-sonnet-4-5"
//! owner_id = "123456789"
//!
//! [compaction]
//! recent_window = 10
//! char_budget = 8000
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── MemoryBackendKind ────────────────────────────────────────────────────────

/// Which memory store implementation backs the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    /// Markdown/JSON files under `~/.pocketpaw/memory/`.
    #[default]
    File,
    /// Embedding-based store with semantic retrieval (external service).
    Semantic,
}

// ─── CompactionConfig ─────────────────────────────────────────────────────────

/// Session-history compaction knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Messages kept verbatim at the tail of the history.
    pub recent_window: usize,
    /// Maximum total characters in the returned history.
    pub char_budget: usize,
    /// Per-message truncation length for Tier-1 one-liner extracts.
    pub summary_chars: usize,
    /// Use an LLM summary for older messages (Tier 2) instead of extracts.
    pub llm_summarize: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            recent_window: 10,
            char_budget: 8000,
            summary_chars: 150,
            llm_summarize: false,
        }
    }
}

// ─── Settings ─────────────────────────────────────────────────────────────────

/// Runtime configuration for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Global cap on concurrently processed conversations.
    pub max_concurrent_conversations: usize,
    /// Show a one-time `/help` pointer on the first message in a chat.
    pub welcome_hint_enabled: bool,
    /// Run the injection scanner on inbound content.
    pub injection_scan_enabled: bool,
    /// Escalate HIGH verdicts to an LLM deep scan before blocking.
    pub injection_scan_llm: bool,
    /// The owner's sender_id. When unset, every sender shares the default
    /// memory scope.
    pub owner_id: Option<String>,
    pub memory_backend: MemoryBackendKind,
    /// LLM fact extraction after each turn (file backend).
    pub file_auto_learn: bool,
    /// Native auto-learn of the semantic backend.
    pub semantic_auto_learn: bool,
    /// Name of the agent backend the router instantiates.
    pub agent_backend: String,
    /// Model identifier passed to the backend.
    pub model: String,
    /// Base URL of the backend API.
    pub api_base_url: String,
    /// Timeout for the first backend event of a run (detects dead backends).
    pub first_event_timeout_secs: u64,
    /// Timeout between subsequent backend events (allows tool execution).
    pub event_timeout_secs: u64,
    pub compaction: CompactionConfig,
    /// Override of the `~/.pocketpaw` home (tests point this at a tempdir).
    pub home_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_conversations: 5,
            welcome_hint_enabled: true,
            injection_scan_enabled: true,
            injection_scan_llm: false,
            owner_id: None,
            memory_backend: MemoryBackendKind::File,
            file_auto_learn: false,
            semantic_auto_learn: false,
            agent_backend: "native".to_owned(),
            model: "claude-sonnet-4-5".to_owned(),
            api_base_url: "https://api.anthropic.com".to_owned(),
            first_event_timeout_secs: 30,
            event_timeout_secs: 120,
            compaction: CompactionConfig::default(),
            home_dir: None,
        }
    }
}

impl Settings {
    /// Resolve the `~/.pocketpaw` home directory, honouring the override.
    pub fn home(&self) -> PathBuf {
        if let Some(ref dir) = self.home_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pocketpaw")
    }

    /// `~/.pocketpaw/memory/`.
    pub fn memory_dir(&self) -> PathBuf {
        self.home().join("memory")
    }

    /// `~/.pocketpaw/identity/`.
    pub fn identity_dir(&self) -> PathBuf {
        self.home().join("identity")
    }

    /// Whether auto-learn applies for the configured memory backend.
    pub fn auto_learn_enabled(&self) -> bool {
        match self.memory_backend {
            MemoryBackendKind::File => self.file_auto_learn,
            MemoryBackendKind::Semantic => self.semantic_auto_learn,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
