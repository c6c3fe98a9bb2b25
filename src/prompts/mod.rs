pub mod context_builder;
pub mod identity;

pub use context_builder::{ContextBuilder, format_hint};
pub use identity::IdentityLoader;
