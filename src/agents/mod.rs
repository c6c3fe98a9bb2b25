//! The agent subsystem: backend contract, router, the native streaming
//! backend, and the orchestrating agent loop.

pub mod backend;
pub mod loop_;
pub mod native;
pub mod router;

pub use backend::{
    AgentBackend, AgentEvent, AgentEventStream, BackendCapabilities, BackendError, BackendInfo,
};
pub use loop_::AgentLoop;
pub use native::{NativeBackend, NativeBackendConfig};
pub use router::{AgentRouter, BackendFactory, default_backend_factory};
