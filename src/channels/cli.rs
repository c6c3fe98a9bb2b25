//! Reference adapter: an interactive terminal chat over stdin/stdout.
//!
//! The CLI is a streaming-capable channel, so chunks are written through as
//! they arrive with no buffering policy.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{
    Channel, InboundMessage, MessageBus, OutboundMessage, OutboundSubscriber, SubscriberId,
};

use super::traits::{ChannelAdapter, ChannelError};

pub struct CliAdapter {
    sender_id: String,
    chat_id: String,
    bus: Mutex<Option<Arc<MessageBus>>>,
    subscription: Mutex<Option<SubscriberId>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CliAdapter {
    pub fn new(sender_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            bus: Mutex::new(None),
            subscription: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChannelAdapter for CliAdapter {
    fn channel(&self) -> Channel {
        Channel::Cli
    }

    async fn start(self: Arc<Self>, bus: Arc<MessageBus>) -> Result<(), ChannelError> {
        let id = bus.subscribe_outbound(Channel::Cli, self.clone()).await;
        *self.subscription.lock().await = Some(id);
        *self.bus.lock().await = Some(bus.clone());

        let sender_id = self.sender_id.clone();
        let chat_id = self.chat_id.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_owned();
                        if line.is_empty() {
                            continue;
                        }
                        let message =
                            InboundMessage::new(Channel::Cli, &sender_id, &chat_id, line);
                        if bus.publish_inbound(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // stdin closed
                    Err(e) => {
                        log::error!("stdin read failed: {e}");
                        break;
                    }
                }
            }
        });
        *self.reader.lock().await = Some(handle);
        log::info!("CLI adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        // Unsubscribe before tearing down I/O, so no fan-out hits a dead pipe.
        if let (Some(bus), Some(id)) = (
            self.bus.lock().await.take(),
            self.subscription.lock().await.take(),
        ) {
            bus.unsubscribe_outbound(Channel::Cli, id).await;
        }
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        log::info!("CLI adapter stopped");
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), ChannelError> {
        use std::io::Write as _;
        let mut stdout = std::io::stdout();
        let result = if message.is_stream_chunk {
            write!(stdout, "{}", message.content).and_then(|_| stdout.flush())
        } else if message.is_stream_end {
            writeln!(stdout).and_then(|_| stdout.flush())
        } else {
            writeln!(stdout, "{}", message.content).and_then(|_| stdout.flush())
        };
        result.map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

#[async_trait]
impl OutboundSubscriber for CliAdapter {
    async fn deliver(&self, message: OutboundMessage) -> Result<(), String> {
        self.send(message).await.map_err(|e| e.to_string())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
