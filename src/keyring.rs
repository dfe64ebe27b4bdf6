//! Credential storage for the notification service bearer token.
//!
//! The auth subsystem owns the token; this layer only needs get/set/remove
//! of a single string, plus a way to ask for invalidation when the server
//! rejects it.
//!
//! # Storage
//!
//! Production: OS keyring entry `roadsign-notify/auth-token`.
//! Test mode: file at `{config_dir}/credentials.json`.
//! Embedding / tests: [`MemoryCredentialStore`].

use anyhow::Result;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Keyring service name.
const KEYRING_SERVICE: &str = "roadsign-notify";
/// Keyring entry holding the bearer token.
const KEYRING_AUTH_TOKEN: &str = "auth-token";

/// Opaque bearer token for the notification service.
///
/// `Debug` is redacted so the token never reaches logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for handshake headers only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(<{} bytes>)", self.0.len())
    }
}

/// Categorized credential storage errors.
#[derive(Debug)]
pub enum KeyringAccessError {
    /// Keyring is locked and requires user interaction to unlock.
    Locked(String),
    /// Access denied, likely due to binary signature change.
    AccessDenied(String),
    /// Data exists but is corrupted or unparseable.
    Corrupted(String),
    /// File-backed store I/O failure.
    Io(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked(msg) => write!(f, "Keyring locked: {msg}"),
            Self::AccessDenied(msg) => write!(f, "Keyring access denied: {msg}"),
            Self::Corrupted(msg) => write!(f, "Credential data corrupted: {msg}"),
            Self::Io(msg) => write!(f, "Credential file error: {msg}"),
            Self::Other(msg) => write!(f, "Keyring error: {msg}"),
        }
    }
}

impl std::error::Error for KeyringAccessError {}

/// Categorize a keyring error for better user feedback.
fn categorize_keyring_error(err: &keyring::Error) -> KeyringAccessError {
    let msg = format!("{err:?}");
    let msg_lower = msg.to_lowercase();

    if msg_lower.contains("user interaction") || msg_lower.contains("user canceled") {
        return KeyringAccessError::Locked(msg);
    }

    if msg_lower.contains("denied")
        || msg_lower.contains("codesign")
        || msg_lower.contains("not allowed")
    {
        return KeyringAccessError::AccessDenied(msg);
    }

    KeyringAccessError::Other(msg)
}

/// Single-token key-value storage.
///
/// Implementations must be cheap enough to call on every watcher tick.
pub trait CredentialStore: Send + Sync {
    /// Read the current token, `None` when absent.
    fn get(&self) -> Result<Option<Credential>, KeyringAccessError>;

    /// Store a token, replacing any previous one.
    fn set(&self, credential: &Credential) -> Result<(), KeyringAccessError>;

    /// Remove the token. Removing an absent token succeeds.
    fn remove(&self) -> Result<(), KeyringAccessError>;

    /// Ask for the token to be invalidated after the server rejected it.
    ///
    /// The default clears the stored token; auth integrations may override
    /// this to route through their own logout flow.
    fn invalidate(&self, reason: &str) {
        log::warn!("[Credentials] Invalidating stored token: {reason}");
        if let Err(e) = self.remove() {
            log::error!("[Credentials] Failed to clear rejected token: {e}");
        }
    }
}

/// OS keyring backed store.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
    account: String,
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            account: KEYRING_AUTH_TOKEN.to_string(),
        }
    }
}

impl KeyringCredentialStore {
    fn entry(&self) -> Result<Entry, KeyringAccessError> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| KeyringAccessError::Other(format!("Failed to create entry: {e:?}")))
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Result<Option<Credential>, KeyringAccessError> {
        match self.entry()?.get_password() {
            Ok(token) if token.is_empty() => Ok(None),
            Ok(token) => Ok(Some(Credential::new(token))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(categorize_keyring_error(&e)),
        }
    }

    fn set(&self, credential: &Credential) -> Result<(), KeyringAccessError> {
        self.entry()?
            .set_password(credential.expose())
            .map_err(|e| categorize_keyring_error(&e))?;
        log::info!("[Credentials] Saved token to OS keyring");
        Ok(())
    }

    fn remove(&self) -> Result<(), KeyringAccessError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                log::info!("[Credentials] Removed token from OS keyring");
                Ok(())
            }
            Err(e) => Err(categorize_keyring_error(&e)),
        }
    }
}

/// On-disk shape of the file-backed store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
}

/// File backed store used in test mode.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `{config_dir}/credentials.json`.
    pub fn in_config_dir() -> Result<Self> {
        Ok(Self::new(
            crate::config::Config::config_dir()?.join("credentials.json"),
        ))
    }

    fn write(&self, stored: &StoredCredentials) -> Result<(), KeyringAccessError> {
        let json = serde_json::to_string_pretty(stored)
            .map_err(|e| KeyringAccessError::Corrupted(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| KeyringAccessError::Io(e.to_string()))?;

        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
            .map_err(|e| KeyringAccessError::Io(e.to_string()))?;

        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Result<Option<Credential>, KeyringAccessError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| KeyringAccessError::Io(e.to_string()))?;
        let stored: StoredCredentials = serde_json::from_str(&content)
            .map_err(|e| KeyringAccessError::Corrupted(format!("JSON parse error: {e}")))?;
        Ok(stored
            .auth_token
            .filter(|t| !t.is_empty())
            .map(Credential::new))
    }

    fn set(&self, credential: &Credential) -> Result<(), KeyringAccessError> {
        self.write(&StoredCredentials {
            auth_token: Some(credential.expose().to_string()),
        })?;
        log::debug!("[Credentials] Saved token to file (test mode)");
        Ok(())
    }

    fn remove(&self) -> Result<(), KeyringAccessError> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| KeyringAccessError::Io(e.to_string()))?;
        }
        Ok(())
    }
}

/// In-process store. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    slot: Arc<Mutex<Option<Credential>>>,
}

impl MemoryCredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a token.
    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::default();
        *store.lock() = Some(Credential::new(token));
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Credential>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<Credential>, KeyringAccessError> {
        Ok(self.lock().clone())
    }

    fn set(&self, credential: &Credential) -> Result<(), KeyringAccessError> {
        *self.lock() = Some(credential.clone());
        Ok(())
    }

    fn remove(&self) -> Result<(), KeyringAccessError> {
        *self.lock() = None;
        Ok(())
    }
}

/// The store appropriate for the current environment.
pub fn default_store() -> Result<Arc<dyn CredentialStore>> {
    if crate::env::should_skip_keyring() {
        return Ok(Arc::new(FileCredentialStore::in_config_dir()?));
    }
    Ok(Arc::new(KeyringCredentialStore::default()))
}
