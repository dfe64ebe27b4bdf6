//! Credential presence watcher.
//!
//! Polls the credential store on a fixed cadence and reports whether the
//! token appeared, disappeared or stayed the same since the last check.
//! Never fails toward its caller: a storage read error is logged and
//! reported as [`TokenChange::Unchanged`].

use std::sync::Arc;

use crate::keyring::{Credential, CredentialStore};

/// Outcome of one watcher tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenChange {
    /// A credential became available, or the stored value was replaced.
    Appeared(Credential),
    /// The credential was cleared.
    Disappeared,
    /// Nothing changed (or storage could not be read).
    Unchanged,
}

/// Observes a single credential in external storage.
pub struct TokenWatcher {
    store: Arc<dyn CredentialStore>,
    current: Option<Credential>,
}

impl std::fmt::Debug for TokenWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenWatcher")
            .field("present", &self.current.is_some())
            .finish_non_exhaustive()
    }
}

impl TokenWatcher {
    /// Create a watcher. The first [`check`](Self::check) reports any
    /// already-stored credential as `Appeared`.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            current: None,
        }
    }

    /// Read the credential straight from storage.
    ///
    /// Read failures are logged and yield `None`.
    pub fn poll(&self) -> Option<Credential> {
        match self.store.get() {
            Ok(credential) => credential,
            Err(e) => {
                log::warn!("[TokenWatcher] Credential read failed: {e}");
                None
            }
        }
    }

    /// Compare storage against the last known state and update it.
    pub fn check(&mut self) -> TokenChange {
        let latest = match self.store.get() {
            Ok(latest) => latest,
            Err(e) => {
                log::warn!("[TokenWatcher] Credential read failed, keeping last state: {e}");
                return TokenChange::Unchanged;
            }
        };

        if self.current == latest {
            return TokenChange::Unchanged;
        }

        match latest {
            None => {
                log::info!("[TokenWatcher] Credential cleared");
                self.current = None;
                TokenChange::Disappeared
            }
            Some(latest) => {
                if self.current.is_some() {
                    log::info!("[TokenWatcher] Credential replaced");
                } else {
                    log::info!("[TokenWatcher] Credential available");
                }
                self.current = Some(latest.clone());
                TokenChange::Appeared(latest)
            }
        }
    }

    /// Last credential observed by [`check`](Self::check).
    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    /// The underlying store (for invalidation requests).
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}
