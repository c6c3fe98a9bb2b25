//! Cross-channel command handler.
//!
//! Parses text commands from any channel and answers them directly, without
//! touching the scanner, memory writes, or the agent backend. `!cmd` is
//! accepted as an alias for `/cmd` on channels where `/` is intercepted
//! client-side (Matrix clients treat unknown slash commands locally).

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::memory::{MemoryManager, SessionSummary};

use super::events::{InboundMessage, OutboundMessage};

const COMMANDS: &[&str] = &[
    "/new", "/sessions", "/resume", "/help", "/clear", "/rename", "/status", "/delete",
];

const HELP_TEXT: &str = "**PocketPaw Commands:**\n\n\
/new — Start a fresh conversation\n\
/sessions — List your conversation sessions\n\
/resume <n> — Resume session #n from the list\n\
/resume <text> — Search and resume a session by title\n\
/clear — Clear the current session history\n\
/rename <title> — Rename the current session\n\
/status — Show current session info\n\
/delete — Delete the current session\n\
/help — Show this help message\n\n\
_Tip: Use !command instead of /command on channels where / is intercepted \
(e.g. Matrix)._";

/// `/cmd` or `!cmd`, optional `@BotName` suffix, then arguments.
fn command_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"(?s)^([/!]\w+)(?:@\S+)?\s*(.*)").expect("static command regex")
    })
}

/// `!cmd` → `/cmd` so the rest of the handler is prefix-agnostic.
fn normalize_cmd(raw: &str) -> String {
    match raw.strip_prefix('!') {
        Some(rest) => format!("/{rest}"),
        None => raw.to_owned(),
    }
}

// ─── CommandHandler ───────────────────────────────────────────────────────────

/// Unified handler for the session slash commands.
pub struct CommandHandler {
    memory: Arc<MemoryManager>,
    /// Backend name, shown by `/status`.
    backend_name: String,
    /// Last session listing shown per base key, so `/resume <n>` can
    /// reference entries by position.
    last_shown: Mutex<HashMap<String, Vec<SessionSummary>>>,
}

impl CommandHandler {
    pub fn new(memory: Arc<MemoryManager>, backend_name: impl Into<String>) -> Self {
        Self {
            memory,
            backend_name: backend_name.into(),
            last_shown: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the content is a recognised command.
    pub fn is_command(&self, content: &str) -> bool {
        command_regex()
            .captures(content.trim())
            .is_some_and(|c| COMMANDS.contains(&normalize_cmd(&c[1].to_lowercase()).as_str()))
    }

    /// Process a command, returning the reply. `None` when the content is
    /// not a recognised command (unknown verbs flow on to the agent).
    pub async fn handle(&self, message: &InboundMessage) -> Option<OutboundMessage> {
        let captures = command_regex().captures(message.content.trim())?;
        let cmd = normalize_cmd(&captures[1].to_lowercase());
        if !COMMANDS.contains(&cmd.as_str()) {
            return None;
        }
        let args = captures[2].trim().to_owned();
        let session_key = message.session_key();

        let reply = match cmd.as_str() {
            "/new" => self.cmd_new(&session_key).await,
            "/sessions" => self.cmd_sessions(&session_key).await,
            "/resume" => self.cmd_resume(&session_key, &args).await,
            "/clear" => self.cmd_clear(&session_key).await,
            "/rename" => self.cmd_rename(&session_key, &args).await,
            "/status" => self.cmd_status(message, &session_key).await,
            "/delete" => self.cmd_delete(&session_key).await,
            "/help" => HELP_TEXT.to_owned(),
            _ => return None,
        };
        Some(OutboundMessage::text(message.channel, &message.chat_id, reply))
    }

    // ── /new ─────────────────────────────────────────────────────────────────

    async fn cmd_new(&self, session_key: &str) -> String {
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let new_key = format!("{session_key}:{suffix}");
        match self.memory.set_session_alias(session_key, &new_key).await {
            Ok(()) => "Started a new conversation. Previous sessions are preserved — \
                       use /sessions to list them."
                .to_owned(),
            Err(e) => format!("Could not start a new session: {e}"),
        }
    }

    // ── /sessions ────────────────────────────────────────────────────────────

    async fn cmd_sessions(&self, session_key: &str) -> String {
        let sessions = match self.memory.list_sessions_for_chat(session_key).await {
            Ok(sessions) => sessions,
            Err(e) => return format!("Could not list sessions: {e}"),
        };
        if sessions.is_empty() {
            return "No sessions found. Start chatting to create one!".to_owned();
        }

        let listing = render_listing("**Sessions:**\n", &sessions);
        self.last_shown
            .lock()
            .await
            .insert(session_key.to_owned(), sessions);
        listing
    }

    // ── /resume ──────────────────────────────────────────────────────────────

    async fn cmd_resume(&self, session_key: &str, args: &str) -> String {
        // No args → show the list (same as /sessions).
        if args.is_empty() {
            return self.cmd_sessions(session_key).await;
        }

        if let Ok(n) = args.parse::<usize>() {
            return self.resume_by_number(session_key, n).await;
        }
        self.resume_by_text(session_key, args).await
    }

    async fn resume_by_number(&self, session_key: &str, n: usize) -> String {
        let shown = {
            let cache = self.last_shown.lock().await;
            cache.get(session_key).cloned()
        };
        let shown = match shown {
            Some(shown) => shown,
            None => {
                // No cached listing — fetch one first.
                let sessions = self
                    .memory
                    .list_sessions_for_chat(session_key)
                    .await
                    .unwrap_or_default();
                self.last_shown
                    .lock()
                    .await
                    .insert(session_key.to_owned(), sessions.clone());
                sessions
            }
        };

        if shown.is_empty() {
            return "No sessions found.".to_owned();
        }
        if n < 1 || n > shown.len() {
            return format!("Invalid session number. Choose 1-{}.", shown.len());
        }

        let target = &shown[n - 1];
        match self
            .memory
            .set_session_alias(session_key, &target.session_key)
            .await
        {
            Ok(()) => format!("Resumed session: {}", target.title),
            Err(e) => format!("Could not resume: {e}"),
        }
    }

    async fn resume_by_text(&self, session_key: &str, query: &str) -> String {
        let sessions = self
            .memory
            .list_sessions_for_chat(session_key)
            .await
            .unwrap_or_default();
        let needle = query.to_lowercase();
        let matches: Vec<SessionSummary> = sessions
            .into_iter()
            .filter(|s| {
                s.title.to_lowercase().contains(&needle)
                    || s.preview.to_lowercase().contains(&needle)
            })
            .collect();

        match matches.len() {
            0 => format!("No sessions matching \"{query}\". Use /sessions to see all."),
            1 => {
                let target = &matches[0];
                match self
                    .memory
                    .set_session_alias(session_key, &target.session_key)
                    .await
                {
                    Ok(()) => format!("Resumed session: {}", target.title),
                    Err(e) => format!("Could not resume: {e}"),
                }
            }
            _ => {
                let listing =
                    render_listing(&format!("Multiple sessions match \"{query}\":\n"), &matches);
                self.last_shown
                    .lock()
                    .await
                    .insert(session_key.to_owned(), matches);
                listing
            }
        }
    }

    // ── /clear ───────────────────────────────────────────────────────────────

    async fn cmd_clear(&self, session_key: &str) -> String {
        let resolved = match self.memory.resolve_session_key(session_key).await {
            Ok(resolved) => resolved,
            Err(e) => return format!("Could not resolve session: {e}"),
        };
        match self.memory.clear_session(&resolved).await {
            Ok(0) => "Session is already empty.".to_owned(),
            Ok(count) => format!("Cleared {count} messages from the current session."),
            Err(e) => format!("Could not clear session: {e}"),
        }
    }

    // ── /rename ──────────────────────────────────────────────────────────────

    async fn cmd_rename(&self, session_key: &str, args: &str) -> String {
        if args.is_empty() {
            return "Usage: /rename <new title>".to_owned();
        }
        let resolved = match self.memory.resolve_session_key(session_key).await {
            Ok(resolved) => resolved,
            Err(e) => return format!("Could not resolve session: {e}"),
        };
        match self.memory.update_session_title(&resolved, args).await {
            Ok(true) => format!("Session renamed to \"{args}\"."),
            Ok(false) => "Could not rename — session not found in index.".to_owned(),
            Err(e) => format!("Could not rename: {e}"),
        }
    }

    // ── /status ──────────────────────────────────────────────────────────────

    async fn cmd_status(&self, message: &InboundMessage, session_key: &str) -> String {
        let resolved = self
            .memory
            .resolve_session_key(session_key)
            .await
            .unwrap_or_else(|_| session_key.to_owned());
        let sessions = self
            .memory
            .list_sessions_for_chat(session_key)
            .await
            .unwrap_or_default();
        let active = sessions.iter().find(|s| s.is_active);

        let title = active.map(|s| s.title.as_str()).unwrap_or("Default");
        let count = active.map(|s| s.message_count).unwrap_or(0);

        let mut lines = vec![
            "**Session Status:**\n".to_owned(),
            format!("Title: {title}"),
            format!("Messages: {count}"),
            format!("Channel: {}", message.channel),
            format!("Session key: {resolved}"),
            format!("Backend: {}", self.backend_name),
        ];
        if resolved != session_key {
            lines.push(format!("Base key: {session_key}"));
        }
        lines.join("\n")
    }

    // ── /delete ──────────────────────────────────────────────────────────────

    async fn cmd_delete(&self, session_key: &str) -> String {
        let resolved = match self.memory.resolve_session_key(session_key).await {
            Ok(resolved) => resolved,
            Err(e) => return format!("Could not resolve session: {e}"),
        };
        let deleted = self.memory.delete_session(&resolved).await.unwrap_or(false);
        // Drop the alias either way so the next message starts at the base key.
        if let Err(e) = self.memory.remove_session_alias(session_key).await {
            log::warn!("failed to remove alias for {session_key}: {e}");
        }

        if deleted {
            "Session deleted. Your next message will start a fresh conversation.".to_owned()
        } else {
            "No session to delete.".to_owned()
        }
    }
}

fn render_listing(heading: &str, sessions: &[SessionSummary]) -> String {
    let mut lines = vec![heading.to_owned()];
    for (i, s) in sessions.iter().enumerate() {
        let marker = if s.is_active { " (active)" } else { "" };
        let title = if s.title.is_empty() { "New Chat" } else { &s.title };
        lines.push(format!(
            "{}. {title} ({} msgs){marker}",
            i + 1,
            s.message_count
        ));
    }
    lines.push("\nUse /resume <number> to switch.".to_owned());
    lines.join("\n")
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::events::Channel;
    use crate::memory::{FileMemoryStore, Role};
    use tempfile::TempDir;

    fn handler() -> (TempDir, Arc<MemoryManager>, CommandHandler) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileMemoryStore::new(dir.path()).unwrap());
        let memory = Arc::new(MemoryManager::new(store, None));
        let handler = CommandHandler::new(memory.clone(), "native");
        (dir, memory, handler)
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage::new(Channel::Telegram, "u1", "42", content)
    }

    #[test]
    fn recognises_slash_and_bang_commands() {
        let (_dir, _mem, h) = handler();
        assert!(h.is_command("/new"));
        assert!(h.is_command("!new"));
        assert!(h.is_command("/sessions@PawBot"));
        assert!(h.is_command("  /help  "));
        assert!(h.is_command("/RENAME project"));
        assert!(!h.is_command("hello /new"));
        assert!(!h.is_command("/unknowncmd"));
        assert!(!h.is_command("plain text"));
    }

    #[tokio::test]
    async fn new_installs_an_eight_hex_alias() {
        let (_dir, mem, h) = handler();
        let reply = h.handle(&inbound("/new")).await.unwrap();
        assert!(reply.content.starts_with("Started a new conversation"));

        let resolved = mem.resolve_session_key("telegram:42").await.unwrap();
        assert_ne!(resolved, "telegram:42");
        assert!(resolved.starts_with("telegram:42:"));
        let suffix = resolved.rsplit(':').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn sessions_then_resume_by_number() {
        let (_dir, mem, h) = handler();
        // Two sessions: the base and one aliased.
        mem.add_to_session("telegram:42", Role::User, "first topic", HashMap::new())
            .await
            .unwrap();
        h.handle(&inbound("/new")).await.unwrap();
        let current = mem.resolve_session_key("telegram:42").await.unwrap();
        mem.add_to_session(&current, Role::User, "second topic", HashMap::new())
            .await
            .unwrap();

        let listing = h.handle(&inbound("/sessions")).await.unwrap();
        assert!(listing.content.contains("1. "));
        assert!(listing.content.contains("2. "));

        // Position 2 is the older (base) session.
        let reply = h.handle(&inbound("/resume 2")).await.unwrap();
        assert!(reply.content.starts_with("Resumed session:"), "{}", reply.content);
        let resolved = mem.resolve_session_key("telegram:42").await.unwrap();
        assert_eq!(resolved, "telegram:42");
    }

    #[tokio::test]
    async fn resume_with_invalid_number_reports_range() {
        let (_dir, mem, h) = handler();
        mem.add_to_session("telegram:42", Role::User, "x", HashMap::new())
            .await
            .unwrap();
        let reply = h.handle(&inbound("/resume 99")).await.unwrap();
        assert!(reply.content.contains("Invalid session number"));
    }

    #[tokio::test]
    async fn resume_by_text_matches_title() {
        let (_dir, mem, h) = handler();
        mem.add_to_session("telegram:42", Role::User, "rust borrow checker", HashMap::new())
            .await
            .unwrap();
        h.handle(&inbound("/new")).await.unwrap();

        let reply = h.handle(&inbound("/resume borrow")).await.unwrap();
        assert!(reply.content.starts_with("Resumed session:"));
        assert_eq!(
            mem.resolve_session_key("telegram:42").await.unwrap(),
            "telegram:42"
        );
    }

    #[tokio::test]
    async fn resume_without_args_lists_sessions() {
        let (_dir, mem, h) = handler();
        mem.add_to_session("telegram:42", Role::User, "topic", HashMap::new())
            .await
            .unwrap();
        let reply = h.handle(&inbound("/resume")).await.unwrap();
        assert!(reply.content.contains("Use /resume <number> to switch."));
    }

    #[tokio::test]
    async fn clear_reports_count_and_empties() {
        let (_dir, mem, h) = handler();
        mem.add_to_session("telegram:42", Role::User, "a", HashMap::new())
            .await
            .unwrap();
        mem.add_to_session("telegram:42", Role::Assistant, "b", HashMap::new())
            .await
            .unwrap();

        let reply = h.handle(&inbound("/clear")).await.unwrap();
        assert!(reply.content.contains("Cleared 2 messages"));

        let again = h.handle(&inbound("/clear")).await.unwrap();
        assert_eq!(again.content, "Session is already empty.");
    }

    #[tokio::test]
    async fn rename_sets_user_title() {
        let (_dir, mem, h) = handler();
        mem.add_to_session("telegram:42", Role::User, "auto title", HashMap::new())
            .await
            .unwrap();
        let reply = h.handle(&inbound("/rename Project X")).await.unwrap();
        assert!(reply.content.contains("renamed to \"Project X\""));

        let sessions = mem.list_sessions_for_chat("telegram:42").await.unwrap();
        assert_eq!(sessions[0].title, "Project X");
    }

    #[tokio::test]
    async fn rename_without_args_shows_usage() {
        let (_dir, _mem, h) = handler();
        let reply = h.handle(&inbound("/rename")).await.unwrap();
        assert_eq!(reply.content, "Usage: /rename <new title>");
    }

    #[tokio::test]
    async fn delete_removes_session_and_alias() {
        let (_dir, mem, h) = handler();
        h.handle(&inbound("/new")).await.unwrap();
        let aliased = mem.resolve_session_key("telegram:42").await.unwrap();
        mem.add_to_session(&aliased, Role::User, "doomed", HashMap::new())
            .await
            .unwrap();

        let reply = h.handle(&inbound("/delete")).await.unwrap();
        assert!(reply.content.contains("Session deleted"));
        assert_eq!(
            mem.resolve_session_key("telegram:42").await.unwrap(),
            "telegram:42",
            "alias removed, base key is its own target again"
        );
        assert!(mem.list_sessions_for_chat("telegram:42").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_shows_resolved_and_base_keys() {
        let (_dir, mem, h) = handler();
        h.handle(&inbound("/new")).await.unwrap();
        let aliased = mem.resolve_session_key("telegram:42").await.unwrap();
        mem.add_to_session(&aliased, Role::User, "hello status", HashMap::new())
            .await
            .unwrap();

        let reply = h.handle(&inbound("/status")).await.unwrap();
        assert!(reply.content.contains(&format!("Session key: {aliased}")));
        assert!(reply.content.contains("Base key: telegram:42"));
        assert!(reply.content.contains("Backend: native"));
        assert!(reply.content.contains("Channel: telegram"));
    }

    #[tokio::test]
    async fn help_lists_all_verbs() {
        let (_dir, _mem, h) = handler();
        let reply = h.handle(&inbound("!help")).await.unwrap();
        for verb in ["/new", "/sessions", "/resume", "/clear", "/rename", "/status", "/delete"] {
            assert!(reply.content.contains(verb), "missing {verb}");
        }
    }

    #[tokio::test]
    async fn unknown_verb_is_not_handled() {
        let (_dir, _mem, h) = handler();
        assert!(h.handle(&inbound("/frobnicate now")).await.is_none());
    }
}
