//! Configuration loading, `PAW_*` env overrides, and atomic saves.
//!
//! Loading order:
//! 1. Parse `~/.pocketpaw/config.toml` (or the path in `PAW_CONFIG`)
//! 2. Apply `PAW_*` environment overrides
//! 3. Fall back to [`Settings::default()`] when the file is missing

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::Settings;

/// Default config file path: `~/.pocketpaw/config.toml`.
pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|h| h.join(".pocketpaw").join("config.toml"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

/// Load [`Settings`] from `path`, falling back to defaults when the file is
/// missing, then applying env overrides.
pub fn load_settings(path: &Path) -> Result<Settings, String> {
    let mut settings = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<Settings>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Load from the default (or `PAW_CONFIG`-specified) path; never fails.
pub fn load_default_settings() -> Settings {
    let path = env::var("PAW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml")));
    load_settings(&path).unwrap_or_default()
}

/// Supported overrides:
/// - `PAW_AGENT_BACKEND`   → `agent_backend`
/// - `PAW_MODEL`           → `model`
/// - `PAW_API_BASE_URL`    → `api_base_url`
/// - `PAW_OWNER_ID`        → `owner_id`
/// - `PAW_MAX_CONVERSATIONS` → `max_concurrent_conversations`
/// - `PAW_INJECTION_SCAN`  → `injection_scan_enabled` (1/0)
/// - `PAW_WELCOME_HINT`    → `welcome_hint_enabled` (1/0)
fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(v) = env::var("PAW_AGENT_BACKEND") {
        settings.agent_backend = v;
    }
    if let Ok(v) = env::var("PAW_MODEL") {
        settings.model = v;
    }
    if let Ok(v) = env::var("PAW_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = env::var("PAW_OWNER_ID") {
        settings.owner_id = Some(v);
    }
    if let Ok(v) = env::var("PAW_MAX_CONVERSATIONS")
        && let Ok(n) = v.parse::<usize>()
    {
        settings.max_concurrent_conversations = n;
    }
    if let Ok(v) = env::var("PAW_INJECTION_SCAN") {
        settings.injection_scan_enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = env::var("PAW_WELCOME_HINT") {
        settings.welcome_hint_enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

/// Atomically save `settings` to `path` (write temp, rename over target).
pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), String> {
    let content =
        toml::to_string_pretty(settings).map_err(|e| format!("failed to serialise config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &content).map_err(|e| format!("failed to write temp config: {e}"))?;
    fs::rename(&tmp_path, path).map_err(|e| format!("failed to replace config file: {e}"))?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn load_invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not toml at all!!!").unwrap();
        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let original = Settings {
            owner_id: Some("owner-7".to_owned()),
            max_concurrent_conversations: 3,
            ..Settings::default()
        };
        save_settings(&path, &original).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b").join("config.toml");
        save_settings(&nested, &Settings::default()).unwrap();
        assert!(nested.exists());
    }
}
