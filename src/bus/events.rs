//! Typed vocabulary for the message bus.
//!
//! Everything that crosses a subsystem boundary is one of three shapes:
//! [`InboundMessage`] (adapter → orchestrator), [`OutboundMessage`]
//! (orchestrator → adapter), or [`SystemEvent`] (orchestrator → observers).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Channel ──────────────────────────────────────────────────────────────────

/// Closed set of communication channels the engine can route for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Telegram,
    Websocket,
    Cli,
    Discord,
    Slack,
    Whatsapp,
    Signal,
    Matrix,
    Teams,
    GoogleChat,
    Webhook,
    /// Internal traffic (subagents, scheduled intentions).
    System,
}

impl Channel {
    /// Canonical snake_case name, as used in session keys and config.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Telegram => "telegram",
            Channel::Websocket => "websocket",
            Channel::Cli => "cli",
            Channel::Discord => "discord",
            Channel::Slack => "slack",
            Channel::Whatsapp => "whatsapp",
            Channel::Signal => "signal",
            Channel::Matrix => "matrix",
            Channel::Teams => "teams",
            Channel::GoogleChat => "google_chat",
            Channel::Webhook => "webhook",
            Channel::System => "system",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Channel::Telegram),
            "websocket" => Ok(Channel::Websocket),
            "cli" => Ok(Channel::Cli),
            "discord" => Ok(Channel::Discord),
            "slack" => Ok(Channel::Slack),
            "whatsapp" => Ok(Channel::Whatsapp),
            "signal" => Ok(Channel::Signal),
            "matrix" => Ok(Channel::Matrix),
            "teams" => Ok(Channel::Teams),
            "google_chat" => Ok(Channel::GoogleChat),
            "webhook" => Ok(Channel::Webhook),
            "system" => Ok(Channel::System),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

// ─── InboundMessage ───────────────────────────────────────────────────────────

/// A message received from a channel adapter.
///
/// Immutable once constructed; the orchestrator consumes each instance
/// exactly once. `session_key()` is the *base* key — alias resolution
/// happens later, in the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: Channel,
    /// Opaque identifier of the external user on that channel.
    pub sender_id: String,
    /// Opaque identifier of the conversation on that channel.
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Local paths of any attached media, in arrival order.
    #[serde(default)]
    pub media: Vec<std::path::PathBuf>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(
        channel: Channel,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Base session key: `"{channel}:{chat_id}"`.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Copy with different content (used after sanitization).
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }
}

// ─── OutboundMessage ──────────────────────────────────────────────────────────

/// A message headed for a channel adapter.
///
/// The two stream flags are mutually exclusive: `is_stream_chunk` marks a
/// partial delta (subsequent chunks append), `is_stream_end` marks the empty
/// terminator. A message with neither flag is a standalone send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<std::path::PathBuf>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub is_stream_chunk: bool,
    #[serde(default)]
    pub is_stream_end: bool,
}

impl OutboundMessage {
    /// A standalone (non-streamed) text message.
    pub fn text(channel: Channel, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel,
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
            is_stream_chunk: false,
            is_stream_end: false,
        }
    }

    /// A streamed delta; the adapter appends it to prior chunks.
    pub fn chunk(channel: Channel, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_stream_chunk: true,
            ..Self::text(channel, chat_id, content)
        }
    }

    /// The empty end-of-stream marker.
    pub fn stream_end(channel: Channel, chat_id: impl Into<String>) -> Self {
        Self {
            is_stream_end: true,
            ..Self::text(channel, chat_id, "")
        }
    }
}

// ─── SystemEvent ──────────────────────────────────────────────────────────────

/// Kinds of internal observability events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    Thinking,
    ThinkingDone,
    ToolStart,
    ToolResult,
    Error,
    AuditEntry,
    HealthUpdate,
}

/// An internal event for observers (dashboard activity feed, log sinks).
///
/// These never reach external chat channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub event_type: SystemEventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(event_type: SystemEventKind, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
