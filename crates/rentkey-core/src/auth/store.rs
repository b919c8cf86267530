use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::introspect::Credential;

/// Credential file name in cache directory
const CREDENTIAL_FILE: &str = "credential.json";

/// Keychain service and entry name for the persisted token
const KEYRING_SERVICE: &str = "rentkey";
const KEYRING_ENTRY: &str = "access-token";

/// Durable home for the single persisted token.
pub trait TokenStorage: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    token: String,
    saved_at: DateTime<Utc>,
}

/// Token persisted as JSON in the cache directory.
pub struct FileStorage {
    cache_dir: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn credential_path(&self) -> PathBuf {
        self.cache_dir.join(CREDENTIAL_FILE)
    }
}

impl TokenStorage for FileStorage {
    fn load(&self) -> Result<Option<String>> {
        let path = self.credential_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read credential file")?;
        let stored: StoredCredential =
            serde_json::from_str(&contents).context("Failed to parse credential file")?;
        Ok(Some(stored.token))
    }

    fn save(&self, token: &str) -> Result<()> {
        let path = self.credential_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredCredential {
            token: token.to_string(),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&stored)?;
        std::fs::write(path, contents).context("Failed to write credential file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.credential_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Token persisted in the OS keychain.
pub struct KeyringStorage;

impl KeyringStorage {
    fn entry() -> Result<Entry> {
        Entry::new(KEYRING_SERVICE, KEYRING_ENTRY).context("Failed to create keyring entry")
    }
}

impl TokenStorage for KeyringStorage {
    fn load(&self) -> Result<Option<String>> {
        match Self::entry()?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    fn save(&self, token: &str) -> Result<()> {
        Self::entry()?
            .set_password(token)
            .context("Failed to store token in keychain")
    }

    fn clear(&self) -> Result<()> {
        match Self::entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

/// Process-local storage. Clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(token.into()))),
        }
    }

    /// Whatever is currently persisted
    pub fn persisted(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TokenStorage for MemoryStorage {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.persisted())
    }

    fn save(&self, token: &str) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// In-memory copy of the current credential, written through to storage.
///
/// Reads never touch storage. Writes are crate-private: the token manager is
/// the only writer, so every change also drives the refresh scheduler.
/// Updating the cached value and persisting it are separate steps, so the
/// manager can persist after releasing its own lock.
pub struct CredentialStore {
    backend: Box<dyn TokenStorage>,
    current: RwLock<Option<Credential>>,
    persisting: Mutex<()>,
}

impl CredentialStore {
    /// Open the store, loading any persisted token. A persisted token that
    /// cannot be decoded is discarded.
    pub fn open(backend: Box<dyn TokenStorage>) -> Self {
        let current = match backend.load() {
            Ok(Some(token)) => match Credential::parse(token) {
                Ok(credential) => {
                    debug!(sub = ?credential.subject(), "Loaded persisted credential");
                    Some(credential)
                }
                Err(e) => {
                    warn!(error = %e, "Discarding undecodable persisted credential");
                    if let Err(e) = backend.clear() {
                        warn!(error = %e, "Failed to remove undecodable credential");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted credential");
                None
            }
        };

        Self {
            backend,
            current: RwLock::new(current),
            persisting: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Option<Credential> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Replace the cached credential without touching storage.
    pub(crate) fn set(&self, credential: Option<Credential>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = credential;
    }

    /// Write the cached credential to storage.
    ///
    /// Always writes whatever is cached at the time of the call, so racing
    /// persists settle on the latest value whatever order they run in.
    pub(crate) fn persist(&self) {
        let _guard = self.persisting.lock().unwrap_or_else(|e| e.into_inner());
        let result = match self.get() {
            Some(credential) => self
                .backend
                .save(credential.token())
                .context("Failed to persist credential"),
            None => self
                .backend
                .clear()
                .context("Failed to remove persisted credential"),
        };
        if let Err(e) = result {
            warn!(error = %format!("{:#}", e), "Credential storage write failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn save(&self, credential: Credential) {
        self.set(Some(credential));
        self.persist();
    }

    #[cfg(test)]
    pub(crate) fn clear(&self) {
        self.set(None);
        self.persist();
    }
}
