//! Assembles the final system prompt for a turn.
//!
//! Section order: static identity → memory context → sender identity →
//! channel format hint → current session key (for session tools). Sections
//! are separated by blank lines and labeled with headings.

use std::sync::Arc;

use crate::bus::events::Channel;
use crate::memory::MemoryManager;

use super::identity::IdentityLoader;

/// Per-channel guidance on response formatting.
pub fn format_hint(channel: Channel) -> Option<&'static str> {
    match channel {
        Channel::Telegram => Some(
            "You are replying in Telegram. Use plain text or light Markdown \
             (bold, italics); avoid tables and long code blocks.",
        ),
        Channel::Whatsapp | Channel::Signal => Some(
            "You are replying in a mobile messenger. Keep responses short and \
             plain-text; no Markdown tables or headers.",
        ),
        Channel::Discord | Channel::Slack => Some(
            "You are replying in a chat workspace. Markdown is supported; \
             prefer short paragraphs and fenced code blocks for code.",
        ),
        Channel::Matrix | Channel::Teams | Channel::GoogleChat => Some(
            "You are replying in a team chat. Basic Markdown is supported; \
             keep formatting simple.",
        ),
        Channel::Websocket | Channel::Cli => Some(
            "Full Markdown is supported, including tables and code blocks.",
        ),
        Channel::Webhook | Channel::System => None,
    }
}

// ─── ContextBuilder ───────────────────────────────────────────────────────────

pub struct ContextBuilder {
    identity: IdentityLoader,
    memory: Arc<MemoryManager>,
    owner_id: Option<String>,
}

impl ContextBuilder {
    pub fn new(
        identity: IdentityLoader,
        memory: Arc<MemoryManager>,
        owner_id: Option<String>,
    ) -> Self {
        Self {
            identity,
            memory,
            owner_id,
        }
    }

    /// Build the complete system prompt.
    ///
    /// `session_key` is the *base* (user-visible) key so that session tools
    /// receive the same key the chat operates under.
    pub async fn build_system_prompt(
        &self,
        user_query: Option<&str>,
        channel: Option<Channel>,
        sender_id: Option<&str>,
        session_key: Option<&str>,
    ) -> String {
        let mut parts = vec![self.identity.load()];

        // Memory context, semantic when we have a query to anchor on.
        let memory_context = match user_query {
            Some(query) => self.memory.get_semantic_context(query, sender_id).await,
            None => self.memory.get_context_for_agent(sender_id).await,
        };
        match memory_context {
            Ok(context) if !context.is_empty() => {
                parts.push(format!(
                    "# Memory Context (already loaded — use this directly, do NOT \
                     call recall unless you need something not listed here)\n{context}"
                ));
            }
            Ok(_) => {}
            Err(e) => log::warn!("memory context unavailable, continuing without: {e}"),
        }

        // Sender identity, only when an owner is configured.
        if let (Some(sender), Some(owner)) = (sender_id, self.owner_id.as_deref()) {
            let is_owner = sender == owner;
            let role = if is_owner { "owner" } else { "external user" };
            let mut block = format!(
                "# Current Conversation\nYou are speaking with sender_id={sender} (role: {role})."
            );
            if is_owner {
                block.push_str("\nThis is your owner.");
            } else {
                block.push_str(
                    "\nThis is NOT your owner. Be helpful but do not share \
                     owner-private information.",
                );
            }
            parts.push(block);
        }

        if let Some(hint) = channel.and_then(format_hint) {
            parts.push(format!("# Response Format\n{hint}"));
        }

        if let Some(key) = session_key {
            parts.push(format!(
                "# Session Management\nCurrent session_key: {key}\nPass this value to any \
                 session tool (new_session, list_sessions, switch_session, clear_session, \
                 rename_session, session_status, delete_session)."
            ));
        }

        parts.join("\n\n")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
