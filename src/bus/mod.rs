//! The message bus: typed events, the in-process hub, and cross-channel
//! command handling.

pub mod commands;
pub mod events;
pub mod queue;

pub use commands::CommandHandler;
pub use events::{Channel, InboundMessage, OutboundMessage, SystemEvent, SystemEventKind};
pub use queue::{
    BusError, MessageBus, OutboundSubscriber, SubscriberId, SystemSubscriber,
    DEFAULT_INBOUND_CAPACITY,
};
