//! `MessageBus` — the in-process hub decoupling channel adapters from the
//! orchestrator.
//!
//! Three lanes:
//! - **inbound**: bounded FIFO, many adapter producers, exactly one consumer
//!   (the agent loop). A full queue applies backpressure to the publisher;
//!   nothing is dropped silently.
//! - **outbound**: per-channel fan-out to registered subscribers. Subscriber
//!   failures are logged and isolated.
//! - **system**: channel-less fan-out for observability events.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, mpsc};

use super::events::{Channel, InboundMessage, OutboundMessage, SystemEvent};

pub const DEFAULT_INBOUND_CAPACITY: usize = 1000;

/// Receives outbound messages for one channel. Adapters implement this
/// (usually by delegating to their `send`).
#[async_trait]
pub trait OutboundSubscriber: Send + Sync {
    async fn deliver(&self, message: OutboundMessage) -> Result<(), String>;
}

/// Receives system events.
#[async_trait]
pub trait SystemSubscriber: Send + Sync {
    async fn deliver(&self, event: SystemEvent) -> Result<(), String>;
}

/// Handle returned by the subscribe methods; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Central message bus for all channel communication.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    inbound_pending: AtomicUsize,
    outbound: RwLock<HashMap<Channel, Vec<(SubscriberId, Arc<dyn OutboundSubscriber>)>>>,
    system: RwLock<Vec<(SubscriberId, Arc<dyn SystemSubscriber>)>>,
    next_id: AtomicU64,
}

impl MessageBus {
    /// Create with the default inbound capacity (1000).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            inbound_pending: AtomicUsize::new(0),
            outbound: RwLock::new(HashMap::new()),
            system: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ── Inbound (adapter → orchestrator) ─────────────────────────────────────

    /// Enqueue a message from an adapter. Awaits (backpressure) when the
    /// queue is full; errors only if the bus is shut down.
    pub async fn publish_inbound(&self, message: InboundMessage) -> Result<(), BusError> {
        log::debug!(
            "inbound {}:{}",
            message.channel,
            message.sender_id.chars().take(8).collect::<String>()
        );
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| BusError::Closed)?;
        self.inbound_pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the next inbound message, or `None` after `timeout`.
    ///
    /// Single-consumer: the receiver is held under a mutex, so concurrent
    /// callers serialize and each message is delivered exactly once.
    pub async fn consume_inbound(&self, timeout: Duration) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => {
                self.inbound_pending.fetch_sub(1, Ordering::Relaxed);
                Some(msg)
            }
            Ok(None) | Err(_) => None,
        }
    }

    /// Number of queued inbound messages (load-shedding signal for adapters).
    pub fn inbound_pending(&self) -> usize {
        self.inbound_pending.load(Ordering::Relaxed)
    }

    // ── Outbound (orchestrator → adapter) ────────────────────────────────────

    /// Register a subscriber for one channel's outbound messages.
    pub async fn subscribe_outbound(
        &self,
        channel: Channel,
        subscriber: Arc<dyn OutboundSubscriber>,
    ) -> SubscriberId {
        let id = self.fresh_id();
        let mut map = self.outbound.write().await;
        map.entry(channel).or_default().push((id, subscriber));
        log::info!("subscribed to {channel} outbound");
        id
    }

    /// Remove a previously registered outbound subscriber. Unknown ids are a
    /// no-op.
    pub async fn unsubscribe_outbound(&self, channel: Channel, id: SubscriberId) {
        let mut map = self.outbound.write().await;
        if let Some(subs) = map.get_mut(&channel) {
            subs.retain(|(sid, _)| *sid != id);
            if subs.is_empty() {
                map.remove(&channel);
            }
        }
    }

    /// Fan a message out to every subscriber of its channel, concurrently.
    ///
    /// A failing subscriber is logged; the rest still deliver. Within one
    /// channel, successive publish calls reach each subscriber in
    /// publication order because this method awaits the whole fan-out.
    pub async fn publish_outbound(&self, message: OutboundMessage) {
        let subs: Vec<_> = {
            let map = self.outbound.read().await;
            match map.get(&message.channel) {
                Some(subs) if !subs.is_empty() => subs.clone(),
                _ => {
                    log::warn!("no subscribers for {}", message.channel);
                    return;
                }
            }
        };

        let deliveries = subs.iter().map(|(id, sub)| {
            let msg = message.clone();
            async move { (*id, sub.deliver(msg).await) }
        });
        for (id, result) in join_all(deliveries).await {
            if let Err(e) = result {
                log::error!("outbound subscriber {id:?} on {} failed: {e}", message.channel);
            }
        }
    }

    /// Send a copy of `message` to every subscribed channel except `exclude`.
    ///
    /// Broadcast copies are standalone sends: stream flags are cleared.
    pub async fn broadcast_outbound(&self, message: OutboundMessage, exclude: Option<Channel>) {
        let channels: Vec<Channel> = {
            let map = self.outbound.read().await;
            map.keys()
                .copied()
                .filter(|ch| Some(*ch) != exclude)
                .collect()
        };
        for channel in channels {
            let copy = OutboundMessage {
                channel,
                is_stream_chunk: false,
                is_stream_end: false,
                ..message.clone()
            };
            self.publish_outbound(copy).await;
        }
    }

    // ── System events ────────────────────────────────────────────────────────

    pub async fn subscribe_system(&self, subscriber: Arc<dyn SystemSubscriber>) -> SubscriberId {
        let id = self.fresh_id();
        self.system.write().await.push((id, subscriber));
        id
    }

    pub async fn unsubscribe_system(&self, id: SubscriberId) {
        self.system.write().await.retain(|(sid, _)| *sid != id);
    }

    /// Fan a system event out to all system subscribers, isolating failures.
    pub async fn publish_system(&self, event: SystemEvent) {
        let subs: Vec<_> = self.system.read().await.clone();
        let deliveries = subs.iter().map(|(id, sub)| {
            let ev = event.clone();
            async move { (*id, sub.deliver(ev).await) }
        });
        for (id, result) in join_all(deliveries).await {
            if let Err(e) = result {
                log::error!("system subscriber {id:?} failed: {e}");
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced by the bus itself.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus is shut down")]
    Closed,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
