//! Channel adapters: the contract, the outbound streaming policies, and the
//! in-tree CLI reference adapter. Provider-specific adapters (Telegram,
//! Discord, ...) implement [`ChannelAdapter`] outside the core.

pub mod cli;
pub mod stream;
pub mod traits;

pub use cli::CliAdapter;
pub use stream::{BatchStreamBuffer, EDIT_INTERVAL, EditStreamBuffer, EditableTransport};
pub use traits::{ChannelAdapter, ChannelError};
