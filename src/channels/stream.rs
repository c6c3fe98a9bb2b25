//! Outbound streaming policies.
//!
//! The orchestrator emits a uniform chunk/stream_end protocol; providers
//! differ in what they can do with it:
//!
//! - streaming-capable transports forward chunks as they arrive (no helper
//!   needed — the CLI and WebSocket adapters write chunks through directly);
//! - edit-based transports (Telegram, Slack, Discord) send a placeholder and
//!   edit it in place, throttled, via [`EditStreamBuffer`];
//! - batch-only transports (WhatsApp Cloud API) accumulate and send exactly
//!   one message on stream end, via [`BatchStreamBuffer`].

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use async_trait::async_trait;

/// Minimum interval between in-place edits of the placeholder message.
pub const EDIT_INTERVAL: Duration = Duration::from_millis(1500);

// ─── EditableTransport ────────────────────────────────────────────────────────

/// The three provider operations an edit-based adapter must supply.
#[async_trait]
pub trait EditableTransport: Send + Sync {
    /// Send the initial placeholder; returns the provider message id.
    async fn send_placeholder(&self, chat_id: &str) -> Result<String, String>;

    /// Replace the text of a previously sent message.
    async fn edit_message(&self, chat_id: &str, message_id: &str, text: &str)
    -> Result<(), String>;

    /// Send a standalone message (used for overflow continuations).
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String>;

    /// Provider's per-message size cap in characters.
    fn max_message_len(&self) -> usize {
        4096
    }
}

// ─── EditStreamBuffer ─────────────────────────────────────────────────────────

struct EditState {
    message_id: String,
    text: String,
    last_edit: Instant,
}

/// Per-chat accumulation with throttled in-place edits.
pub struct EditStreamBuffer<T: EditableTransport> {
    transport: T,
    buffers: Mutex<HashMap<String, EditState>>,
    edit_interval: Duration,
}

impl<T: EditableTransport> EditStreamBuffer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buffers: Mutex::new(HashMap::new()),
            edit_interval: EDIT_INTERVAL,
        }
    }

    /// Override the edit throttle (tests).
    pub fn with_edit_interval(mut self, interval: Duration) -> Self {
        self.edit_interval = interval;
        self
    }

    /// Feed one stream chunk for `chat_id`.
    ///
    /// The first chunk sends the placeholder; later chunks append and edit
    /// the placeholder at most once per edit interval.
    pub async fn push_chunk(&self, chat_id: &str, content: &str) -> Result<(), String> {
        let mut buffers = self.buffers.lock().await;
        match buffers.get_mut(chat_id) {
            None => {
                let message_id = self.transport.send_placeholder(chat_id).await?;
                buffers.insert(
                    chat_id.to_owned(),
                    EditState {
                        message_id,
                        text: content.to_owned(),
                        last_edit: Instant::now(),
                    },
                );
            }
            Some(state) => {
                state.text.push_str(content);
                if state.last_edit.elapsed() >= self.edit_interval && !state.text.trim().is_empty()
                {
                    self.transport
                        .edit_message(chat_id, &state.message_id, &state.text)
                        .await?;
                    state.last_edit = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Flush on stream end: one final edit, plus overflow messages split at
    /// newline boundaries when the text exceeds the provider cap.
    pub async fn finish(&self, chat_id: &str) -> Result<(), String> {
        let Some(state) = self.buffers.lock().await.remove(chat_id) else {
            return Ok(());
        };
        let cap = self.transport.max_message_len();
        if state.text.trim().is_empty() {
            return Ok(());
        }

        let pieces = split_at_cap(&state.text, cap);
        let mut pieces = pieces.into_iter();
        if let Some(first) = pieces.next() {
            self.transport
                .edit_message(chat_id, &state.message_id, &first)
                .await?;
        }
        for piece in pieces {
            self.transport.send_message(chat_id, &piece).await?;
        }
        Ok(())
    }
}

/// Split `text` into pieces of at most `cap` characters, preferring newline
/// boundaries.
fn split_at_cap(text: &str, cap: usize) -> Vec<String> {
    if text.chars().count() <= cap {
        return vec![text.to_owned()];
    }
    let mut pieces = Vec::new();
    let mut rest = text;
    while rest.chars().count() > cap {
        let head: String = rest.chars().take(cap).collect();
        // Cut at the last newline inside the window where possible.
        let cut = head.rfind('\n').filter(|&i| i > 0).unwrap_or(head.len());
        pieces.push(rest[..cut].to_owned());
        rest = rest[cut..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        pieces.push(rest.to_owned());
    }
    pieces
}

// ─── BatchStreamBuffer ────────────────────────────────────────────────────────

/// Per-chat accumulation for transports that cannot edit: exactly one send
/// on stream end.
#[derive(Default)]
pub struct BatchStreamBuffer {
    buffers: Mutex<HashMap<String, String>>,
}

impl BatchStreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_chunk(&self, chat_id: &str, content: &str) {
        self.buffers
            .lock()
            .await
            .entry(chat_id.to_owned())
            .or_default()
            .push_str(content);
    }

    /// Take the accumulated text for `chat_id`, if any.
    pub async fn finish(&self, chat_id: &str) -> Option<String> {
        self.buffers
            .lock()
            .await
            .remove(chat_id)
            .filter(|text| !text.trim().is_empty())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
