//! Session management tools.
//!
//! The same verbs as the slash commands, exposed as tools so the model can
//! manage sessions from natural language. Every tool requires the
//! `session_key` argument, which the context builder injects into the system
//! prompt as the user-visible base key.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::memory::MemoryManager;

use super::{Tool, ToolRegistry};

fn session_key_arg(args: &Value) -> Result<String, String> {
    args.get("session_key")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| "missing required argument: session_key".to_owned())
}

fn session_key_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_key": {
                "type": "string",
                "description": "The current session key (provided in the system prompt)."
            }
        },
        "required": ["session_key"]
    })
}

/// Register all session tools on a registry.
pub fn register_session_tools(registry: &mut ToolRegistry, memory: Arc<MemoryManager>) {
    registry.register(Arc::new(NewSessionTool { memory: memory.clone() }));
    registry.register(Arc::new(ListSessionsTool { memory: memory.clone() }));
    registry.register(Arc::new(SwitchSessionTool { memory: memory.clone() }));
    registry.register(Arc::new(ClearSessionTool { memory: memory.clone() }));
    registry.register(Arc::new(RenameSessionTool { memory: memory.clone() }));
    registry.register(Arc::new(SessionStatusTool { memory: memory.clone() }));
    registry.register(Arc::new(DeleteSessionTool { memory }));
}

// ─── new_session ──────────────────────────────────────────────────────────────

pub struct NewSessionTool {
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for NewSessionTool {
    fn name(&self) -> &str {
        "new_session"
    }

    fn description(&self) -> &str {
        "Start a fresh conversation session. The previous session is preserved and \
         can be resumed later. Call this when the user wants to start over or begin \
         a new topic."
    }

    fn parameters_schema(&self) -> Value {
        session_key_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let session_key = session_key_arg(&args)?;
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let new_key = format!("{session_key}:{suffix}");
        self.memory
            .set_session_alias(&session_key, &new_key)
            .await
            .map_err(|e| format!("failed to create new session: {e}"))?;
        Ok("Started a new conversation session. Previous sessions are preserved — \
            use list_sessions to see them."
            .to_owned())
    }
}

// ─── list_sessions ────────────────────────────────────────────────────────────

pub struct ListSessionsTool {
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for ListSessionsTool {
    fn name(&self) -> &str {
        "list_sessions"
    }

    fn description(&self) -> &str {
        "List all conversation sessions for the current chat. Returns session \
         titles, message counts, and which one is active."
    }

    fn parameters_schema(&self) -> Value {
        session_key_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let session_key = session_key_arg(&args)?;
        let sessions = self
            .memory
            .list_sessions_for_chat(&session_key)
            .await
            .map_err(|e| format!("failed to list sessions: {e}"))?;
        if sessions.is_empty() {
            return Ok("No sessions found. Start chatting to create one!".to_owned());
        }
        Ok(sessions
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let marker = if s.is_active { " (active)" } else { "" };
                format!("{}. {} ({} msgs){marker}", i + 1, s.title, s.message_count)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

// ─── switch_session ───────────────────────────────────────────────────────────

pub struct SwitchSessionTool {
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for SwitchSessionTool {
    fn name(&self) -> &str {
        "switch_session"
    }

    fn description(&self) -> &str {
        "Switch to a different conversation session by number (from list_sessions) \
         or by searching session titles. Use this when the user wants to resume or \
         go back to a previous conversation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_key": {
                    "type": "string",
                    "description": "The current session key (provided in the system prompt)."
                },
                "target": {
                    "type": "string",
                    "description": "Session number (from list_sessions) or text to search in session titles."
                }
            },
            "required": ["session_key", "target"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let session_key = session_key_arg(&args)?;
        let target = args
            .get("target")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing required argument: target".to_owned())?;

        let sessions = self
            .memory
            .list_sessions_for_chat(&session_key)
            .await
            .map_err(|e| format!("failed to list sessions: {e}"))?;
        if sessions.is_empty() {
            return Ok("No sessions found.".to_owned());
        }

        if let Ok(n) = target.parse::<usize>() {
            if n < 1 || n > sessions.len() {
                return Ok(format!("Invalid session number. Choose 1-{}.", sessions.len()));
            }
            let chosen = &sessions[n - 1];
            self.memory
                .set_session_alias(&session_key, &chosen.session_key)
                .await
                .map_err(|e| format!("failed to switch: {e}"))?;
            return Ok(format!("Switched to session: {}", chosen.title));
        }

        let needle = target.to_lowercase();
        let matches: Vec<_> = sessions
            .iter()
            .filter(|s| {
                s.title.to_lowercase().contains(&needle)
                    || s.preview.to_lowercase().contains(&needle)
            })
            .collect();
        match matches.len() {
            0 => Ok(format!("No sessions matching \"{target}\".")),
            1 => {
                self.memory
                    .set_session_alias(&session_key, &matches[0].session_key)
                    .await
                    .map_err(|e| format!("failed to switch: {e}"))?;
                Ok(format!("Switched to session: {}", matches[0].title))
            }
            _ => Ok(format!(
                "Multiple sessions match \"{target}\":\n{}",
                matches
                    .iter()
                    .enumerate()
                    .map(|(i, s)| format!("{}. {} ({} msgs)", i + 1, s.title, s.message_count))
                    .collect::<Vec<_>>()
                    .join("\n")
            )),
        }
    }
}

// ─── clear_session ────────────────────────────────────────────────────────────

pub struct ClearSessionTool {
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for ClearSessionTool {
    fn name(&self) -> &str {
        "clear_session"
    }

    fn description(&self) -> &str {
        "Clear the current session's conversation history. The session itself \
         remains and new messages continue in it."
    }

    fn parameters_schema(&self) -> Value {
        session_key_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let session_key = session_key_arg(&args)?;
        let resolved = self
            .memory
            .resolve_session_key(&session_key)
            .await
            .map_err(|e| format!("failed to resolve session: {e}"))?;
        let count = self
            .memory
            .clear_session(&resolved)
            .await
            .map_err(|e| format!("failed to clear session: {e}"))?;
        if count == 0 {
            Ok("Session is already empty.".to_owned())
        } else {
            Ok(format!("Cleared {count} messages from the current session."))
        }
    }
}

// ─── rename_session ───────────────────────────────────────────────────────────

pub struct RenameSessionTool {
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for RenameSessionTool {
    fn name(&self) -> &str {
        "rename_session"
    }

    fn description(&self) -> &str {
        "Rename the current session. The new title protects the session from \
         automatic title updates."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_key": {
                    "type": "string",
                    "description": "The current session key (provided in the system prompt)."
                },
                "title": {
                    "type": "string",
                    "description": "The new session title."
                }
            },
            "required": ["session_key", "title"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let session_key = session_key_arg(&args)?;
        let title = args
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing required argument: title".to_owned())?;
        let resolved = self
            .memory
            .resolve_session_key(&session_key)
            .await
            .map_err(|e| format!("failed to resolve session: {e}"))?;
        let renamed = self
            .memory
            .update_session_title(&resolved, title)
            .await
            .map_err(|e| format!("failed to rename: {e}"))?;
        if renamed {
            Ok(format!("Session renamed to \"{title}\"."))
        } else {
            Ok("Could not rename — session not found.".to_owned())
        }
    }
}

// ─── session_status ───────────────────────────────────────────────────────────

pub struct SessionStatusTool {
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for SessionStatusTool {
    fn name(&self) -> &str {
        "session_status"
    }

    fn description(&self) -> &str {
        "Show the current session's title, message count, and resolved session key."
    }

    fn parameters_schema(&self) -> Value {
        session_key_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let session_key = session_key_arg(&args)?;
        let resolved = self
            .memory
            .resolve_session_key(&session_key)
            .await
            .map_err(|e| format!("failed to resolve session: {e}"))?;
        let sessions = self
            .memory
            .list_sessions_for_chat(&session_key)
            .await
            .map_err(|e| format!("failed to list sessions: {e}"))?;
        let active = sessions.iter().find(|s| s.is_active);
        Ok(format!(
            "Title: {}\nMessages: {}\nSession key: {resolved}",
            active.map(|s| s.title.as_str()).unwrap_or("Default"),
            active.map(|s| s.message_count).unwrap_or(0),
        ))
    }
}

// ─── delete_session ───────────────────────────────────────────────────────────

pub struct DeleteSessionTool {
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for DeleteSessionTool {
    fn name(&self) -> &str {
        "delete_session"
    }

    fn description(&self) -> &str {
        "Delete the current session entirely (history, title, alias). The next \
         message starts a fresh conversation. Only call this when the user \
         explicitly asks to delete the conversation."
    }

    fn parameters_schema(&self) -> Value {
        session_key_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let session_key = session_key_arg(&args)?;
        let resolved = self
            .memory
            .resolve_session_key(&session_key)
            .await
            .map_err(|e| format!("failed to resolve session: {e}"))?;
        let deleted = self
            .memory
            .delete_session(&resolved)
            .await
            .map_err(|e| format!("failed to delete session: {e}"))?;
        self.memory
            .remove_session_alias(&session_key)
            .await
            .map_err(|e| format!("failed to remove alias: {e}"))?;
        if deleted {
            Ok("Session deleted. The next message starts a fresh conversation.".to_owned())
        } else {
            Ok("No session to delete.".to_owned())
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
