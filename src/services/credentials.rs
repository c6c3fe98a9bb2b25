//! Machine-bound encrypted credential storage.
//!
//! Secrets (bot tokens, API keys) live in `~/.pocketpaw/secrets.enc` as
//! AES-256-GCM ciphertext over a JSON map. The key is derived from machine
//! identity plus a random salt stored next to it, so the file only decrypts
//! on the machine and account that wrote it:
//!
//! ```text
//! ~/.pocketpaw/secrets.enc   ← nonce || ciphertext
//! ~/.pocketpaw/.salt         ← 16 random bytes
//! ```
//!
//! A failed decrypt (copied to another machine, corrupted) degrades to an
//! empty store with a warning — never a crash. Files are written with
//! owner-only permissions where the host supports them.

use std::{collections::HashMap, fs, path::PathBuf, sync::Mutex};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KDF_ROUNDS: u32 = 100_000;

/// Secret names the engine itself knows about.
pub const SECRET_FIELDS: &[&str] = &[
    "anthropic_api_key",
    "openai_api_key",
    "telegram_bot_token",
    "discord_bot_token",
    "slack_bot_token",
    "slack_app_token",
    "whatsapp_access_token",
    "whatsapp_verify_token",
];

// ─── CredentialError ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("encryption failed: {0}")]
    Crypto(String),
}

// ─── CredentialStore ──────────────────────────────────────────────────────────

pub struct CredentialStore {
    config_dir: PathBuf,
    cache: Mutex<Option<HashMap<String, String>>>,
}

impl CredentialStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            cache: Mutex::new(None),
        }
    }

    /// Default location: `~/.pocketpaw/`.
    pub fn default_dir() -> Result<PathBuf, CredentialError> {
        dirs::home_dir()
            .map(|h| h.join(".pocketpaw"))
            .ok_or_else(|| CredentialError::Crypto("no home directory".to_owned()))
    }

    fn secrets_path(&self) -> PathBuf {
        self.config_dir.join("secrets.enc")
    }

    fn salt_path(&self) -> PathBuf {
        self.config_dir.join(".salt")
    }

    // ── Key derivation ───────────────────────────────────────────────────────

    /// Hostname + machine id + account name; stable across restarts, not
    /// portable across machines.
    fn machine_identity() -> Vec<u8> {
        let machine_id = fs::read_to_string("/etc/machine-id")
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|_| std::env::var("HOSTNAME").unwrap_or_else(|_| "pocketpaw".into()));
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "pocketpaw".into());
        format!("{machine_id}|{user}|{}", std::env::consts::OS).into_bytes()
    }

    fn load_or_create_salt(&self) -> Result<Vec<u8>, CredentialError> {
        fs::create_dir_all(&self.config_dir)?;
        restrict_dir_permissions(&self.config_dir);

        let path = self.salt_path();
        if let Ok(salt) = fs::read(&path)
            && salt.len() >= SALT_LEN
        {
            return Ok(salt[..SALT_LEN].to_vec());
        }

        let mut salt = [0u8; SALT_LEN];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut salt);
        fs::write(&path, salt)?;
        restrict_file_permissions(&path);
        Ok(salt.to_vec())
    }

    /// Iterated SHA-256 over identity + salt.
    fn derive_key(&self) -> Result<[u8; 32], CredentialError> {
        let salt = self.load_or_create_salt()?;
        let mut identity = Self::machine_identity();

        let mut digest: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(&identity);
            hasher.update(&salt);
            hasher.finalize().into()
        };
        for _ in 0..KDF_ROUNDS {
            let mut hasher = Sha256::new();
            hasher.update(digest);
            hasher.update(&salt);
            digest = hasher.finalize().into();
        }
        identity.zeroize();
        Ok(digest)
    }

    // ── Load / save ──────────────────────────────────────────────────────────

    fn load(&self) -> HashMap<String, String> {
        if let Ok(cache) = self.cache.lock()
            && let Some(data) = cache.as_ref()
        {
            return data.clone();
        }

        let data = self.load_from_disk();
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(data.clone());
        }
        data
    }

    fn load_from_disk(&self) -> HashMap<String, String> {
        let raw = match fs::read(self.secrets_path()) {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };
        if raw.len() <= NONCE_LEN {
            log::warn!("secrets.enc is truncated, starting with an empty credential store");
            return HashMap::new();
        }

        let key = match self.derive_key() {
            Ok(key) => key,
            Err(e) => {
                log::warn!("credential key derivation failed: {e}; starting empty");
                return HashMap::new();
            }
        };
        let cipher = match Aes256Gcm::new_from_slice(&key) {
            Ok(cipher) => cipher,
            Err(e) => {
                log::warn!("credential cipher init failed: {e}; starting empty");
                return HashMap::new();
            }
        };

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        match cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()
            .and_then(|plain| serde_json::from_slice::<HashMap<String, String>>(&plain).ok())
        {
            Some(data) => data,
            None => {
                log::warn!(
                    "failed to decrypt secrets.enc (machine changed? corrupted?); \
                     starting with an empty credential store"
                );
                HashMap::new()
            }
        }
    }

    fn save(&self, data: &HashMap<String, String>) -> Result<(), CredentialError> {
        fs::create_dir_all(&self.config_dir)?;
        restrict_dir_permissions(&self.config_dir);

        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::Crypto(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut plaintext =
            serde_json::to_vec(data).map_err(|e| CredentialError::Crypto(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| CredentialError::Crypto(e.to_string()))?;
        plaintext.zeroize();

        let mut file_content = nonce.to_vec();
        file_content.extend_from_slice(&ciphertext);
        let path = self.secrets_path();
        fs::write(&path, file_content)?;
        restrict_file_permissions(&path);

        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(data.clone());
        }
        Ok(())
    }

    // ── Public API ───────────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<String> {
        self.load().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: &str) -> Result<(), CredentialError> {
        let mut data = self.load();
        data.insert(name.to_owned(), value.to_owned());
        self.save(&data)
    }

    pub fn delete(&self, name: &str) -> Result<(), CredentialError> {
        let mut data = self.load();
        if data.remove(name).is_some() {
            self.save(&data)?;
        }
        Ok(())
    }

    pub fn get_all(&self) -> HashMap<String, String> {
        self.load()
    }

    /// Force a re-read from disk on next access.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }
}

#[cfg(unix)]
fn restrict_file_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt as _;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        log::warn!("could not restrict permissions on {path:?}: {e}");
    }
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &std::path::Path) {}

#[cfg(unix)]
fn restrict_dir_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt as _;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
        log::warn!("could not restrict permissions on {path:?}: {e}");
    }
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_path: &std::path::Path) {}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());

        store.set("anthropic_api_key", "sk-test-123").unwrap();
        assert_eq!(store.get("anthropic_api_key").as_deref(), Some("sk-test-123"));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn values_are_encrypted_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("telegram_bot_token", "123456:SECRETVALUE").unwrap();

        let raw = fs::read(dir.path().join("secrets.enc")).unwrap();
        let raw_str = String::from_utf8_lossy(&raw);
        assert!(!raw_str.contains("SECRETVALUE"));
        assert!(!raw_str.contains("telegram_bot_token"));
    }

    #[test]
    fn reload_after_cache_clear_still_decrypts() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("k", "v").unwrap();
        store.clear_cache();
        assert_eq!(store.get("k").as_deref(), Some("v"));

        // A second store over the same directory decrypts too.
        let other = CredentialStore::new(dir.path());
        assert_eq!(other.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn delete_removes_secret() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        store.delete("a").unwrap();

        assert!(store.get("a").is_none());
        assert_eq!(store.get("b").as_deref(), Some("2"));
        assert_eq!(store.get_all().len(), 1);
    }

    #[test]
    fn corrupted_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("k", "v").unwrap();

        fs::write(dir.path().join("secrets.enc"), b"garbage bytes here!").unwrap();
        store.clear_cache();
        assert!(store.get("k").is_none(), "corrupted store reads as empty");
    }

    #[test]
    fn salt_change_invalidates_old_file_gracefully() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("k", "v").unwrap();

        // A new salt means a new key; the old ciphertext no longer decrypts.
        fs::write(dir.path().join(".salt"), [9u8; SALT_LEN]).unwrap();
        store.clear_cache();
        assert!(store.get("k").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        store.set("k", "v").unwrap();

        let mode = fs::metadata(dir.path().join("secrets.enc"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
