//! The agent backend contract.
//!
//! A backend is whatever turns a prompt into a stream of [`AgentEvent`]s: a
//! hosted model API, a local model, or a subprocess wrapping another agent
//! runtime. The orchestrator drives backends exclusively through
//! [`AgentBackend`] and the tagged event stream, so it can exhaustively
//! match on every event kind.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::memory::ChatMessage;

// ─── AgentEvent ───────────────────────────────────────────────────────────────

/// One token of the backend → orchestrator stream.
///
/// At most one `Done` terminates any run; backends must not emit the same
/// text both as deltas and again inside a final `Message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant text delta, streamed to the user.
    Message { content: String },
    /// Reasoning delta; observers only, never user-visible.
    Thinking { content: String },
    ThinkingDone,
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolResult { name: String, content: String },
    /// A code block the backend is about to execute.
    Code { language: String, content: String },
    /// Output of executed code.
    Output { content: String },
    Error { content: String },
    Done,
}

// ─── BackendCapabilities ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub multi_turn: bool,
    pub custom_system_prompt: bool,
}

// ─── BackendInfo ──────────────────────────────────────────────────────────────

/// Static description of a backend, used for routing and the `/status`
/// surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub display_name: String,
    pub capabilities: BackendCapabilities,
    #[serde(default)]
    pub builtin_tools: Vec<String>,
    /// Tool name → policy (`"allow"`, `"ask"`, `"deny"`).
    #[serde(default)]
    pub tool_policy_map: std::collections::HashMap<String, String>,
    /// Credential names this backend needs before it can run.
    #[serde(default)]
    pub required_keys: Vec<String>,
    #[serde(default)]
    pub supported_providers: Vec<String>,
}

// ─── BackendError ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend configuration invalid: {0}")]
    Config(String),
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("missing credential: {0}")]
    MissingCredential(String),
}

/// The event stream a run yields. Dropping it tears down the producer.
pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

// ─── AgentBackend trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn info(&self) -> BackendInfo;

    /// Start one run. Events arrive on the returned stream; the stream ends
    /// after `Done` (or an `Error` followed by `Done`).
    async fn run(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
        session_key: Option<&str>,
    ) -> Result<AgentEventStream, BackendError>;

    /// Tear down any in-flight run and its resources (tasks, sockets,
    /// subprocesses).
    async fn stop(&self);

    /// Implementation-defined status surface.
    async fn get_status(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged() {
        let event = AgentEvent::Message {
            content: "hi".to_owned(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"message","content":"hi"}"#);

        let done: AgentEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(done, AgentEvent::Done);
    }

    #[test]
    fn tool_use_round_trips_input() {
        let event = AgentEvent::ToolUse {
            name: "search".to_owned(),
            input: serde_json::json!({"query": "rust"}),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
