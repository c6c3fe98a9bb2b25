pub mod loader;
pub mod schema;

pub use loader::{default_config_path, load_default_settings, load_settings, save_settings};
pub use schema::{CompactionConfig, MemoryBackendKind, Settings};
