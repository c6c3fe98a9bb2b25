//! PocketPaw — a self-hosted personal AI agent.
//!
//! This crate is the conversation orchestration engine: it ingests messages
//! from pluggable channel adapters, normalizes them onto a typed in-process
//! bus, serializes per-session processing under a global concurrency cap,
//! consults layered memory to build a system prompt, screens inbound content
//! for prompt injection, and drives a pluggable agent backend whose event
//! stream is translated into per-channel outbound chunks.
//!
//! Data flow:
//!
//! ```text
//! adapter → bus.inbound → agent loop → (memory, context, scanner, router)
//!         → backend → event stream → bus.outbound(channel) → adapter
//! ```

pub mod agents;
pub mod bus;
pub mod channels;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod prompts;
pub mod security;
pub mod services;
pub mod tools;

/// Convenience re-exports for the most commonly used types across the
/// PocketPaw codebase.
///
/// ```rust
/// use pocketpaw::prelude::*;
/// ```
pub mod prelude {
    // Bus
    pub use crate::bus::{
        Channel, CommandHandler, InboundMessage, MessageBus, OutboundMessage, OutboundSubscriber,
        SystemEvent, SystemEventKind, SystemSubscriber,
    };

    // Channels
    pub use crate::channels::{ChannelAdapter, ChannelError, CliAdapter};

    // Configuration
    pub use crate::config::{Settings, load_default_settings};

    // Memory
    pub use crate::memory::{
        ChatMessage, FileMemoryStore, MemoryEntry, MemoryKind, MemoryManager, MemoryStore, Role,
    };

    // Prompts
    pub use crate::prompts::{ContextBuilder, IdentityLoader};

    // Security
    pub use crate::security::{AuditLogger, InjectionScanner, ThreatLevel};

    // Agents
    pub use crate::agents::{
        AgentBackend, AgentEvent, AgentLoop, AgentRouter, BackendInfo, default_backend_factory,
    };

    // Tools
    pub use crate::tools::{Tool, ToolRegistry};

    // Services
    pub use crate::services::{CredentialStore, RateLimiter};

    // Lifecycle
    pub use crate::lifecycle::{Lifecycle, LifecycleRegistry};
}
