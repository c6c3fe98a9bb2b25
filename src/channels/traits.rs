//! The channel adapter contract.
//!
//! An adapter owns one transport (Telegram bot, browser WebSocket, stdin).
//! On `start` it must subscribe itself for its channel's outbound traffic;
//! on `stop` it must unsubscribe *before* releasing transport I/O so no
//! in-flight fan-out is lost. Concrete provider adapters live outside the
//! core; [`crate::channels::CliAdapter`] is the in-tree reference.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Channel, MessageBus, OutboundMessage};

// ─── ChannelError ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("adapter not started")]
    NotStarted,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("configuration invalid: {0}")]
    Config(String),
}

// ─── ChannelAdapter trait ─────────────────────────────────────────────────────

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel identity this adapter handles.
    fn channel(&self) -> Channel;

    /// Connect the transport and subscribe for outbound messages. The
    /// adapter is expected to construct `InboundMessage`s from provider
    /// events (applying its allow-lists) and call `bus.publish_inbound`.
    async fn start(self: Arc<Self>, bus: Arc<MessageBus>) -> Result<(), ChannelError>;

    /// Unsubscribe from the bus, then release transport I/O.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Deliver one outbound message through the transport.
    async fn send(&self, message: OutboundMessage) -> Result<(), ChannelError>;
}
