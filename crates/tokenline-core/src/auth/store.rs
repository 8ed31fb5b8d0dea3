//! Async key-value persistence for credentials and the cached user.
//!
//! The pipeline only ever talks to [`Credentials`], a typed facade over any
//! [`CredentialStore`] backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{TokenPair, User};

/// Value written under [`StorageKey::IsLoggedIn`] after a successful login
const LOGGED_IN: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    AuthToken,
    RefreshToken,
    User,
    IsLoggedIn,
}

impl StorageKey {
    pub const ALL: [StorageKey; 4] = [
        StorageKey::AuthToken,
        StorageKey::RefreshToken,
        StorageKey::User,
        StorageKey::IsLoggedIn,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageKey::AuthToken => "authToken",
            StorageKey::RefreshToken => "refreshToken",
            StorageKey::User => "user",
            StorageKey::IsLoggedIn => "isLoggedIn",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keychain error: {0}")]
    Keychain(#[from] keyring::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid stored value for {key}: {source}")]
    Corrupt {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: StorageKey, value: &str) -> Result<(), StoreError>;

    /// Removing a missing key is not an error
    async fn remove(&self, key: StorageKey) -> Result<(), StoreError>;
}

/// Process-local store, lost on exit. Used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<StorageKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read, for observers that cannot await
    pub fn peek(&self, key: StorageKey) -> Option<String> {
        self.values.lock().get(&key).cloned()
    }

    pub fn contains(&self, key: StorageKey) -> bool {
        self.values.lock().contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().get(&key).cloned())
    }

    async fn set(&self, key: StorageKey, value: &str) -> Result<(), StoreError> {
        self.values.lock().insert(key, value.to_string());
        Ok(())
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
        self.values.lock().remove(&key);
        Ok(())
    }
}

/// JSON file store, one object keyed by [`StorageKey::as_str`].
///
/// Every operation rereads the file so several processes sharing it see each
/// other's writes.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
            key: "<file>",
            source,
        })
    }

    fn write_all(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(values).map_err(|source| {
            StoreError::Corrupt {
                key: "<file>",
                source,
            }
        })?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key.as_str()))
    }

    async fn set(&self, key: StorageKey, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut values = self.read_all()?;
        values.insert(key.as_str().to_string(), value.to_string());
        self.write_all(&values)
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut values = self.read_all()?;
        if values.remove(key.as_str()).is_some() {
            self.write_all(&values)?;
        }
        Ok(())
    }
}

/// Typed access to the credential keys.
/// Clone is cheap - the backend sits behind an `Arc`.
#[derive(Clone)]
pub struct Credentials {
    store: Arc<dyn CredentialStore>,
}

impl Credentials {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub async fn access_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(StorageKey::AuthToken)
            .await?
            .filter(|t| !t.is_empty()))
    }

    pub async fn refresh_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(StorageKey::RefreshToken)
            .await?
            .filter(|t| !t.is_empty()))
    }

    pub async fn user(&self) -> Result<Option<User>, StoreError> {
        match self.store.get(StorageKey::User).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: StorageKey::User.as_str(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub async fn is_logged_in(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(StorageKey::IsLoggedIn).await?.as_deref() == Some(LOGGED_IN))
    }

    /// Persist both halves of a credential pair. Access token first, so a
    /// concurrent reader never pairs a new refresh token with a stale access token.
    pub async fn save_tokens(&self, tokens: &TokenPair) -> Result<(), StoreError> {
        self.store
            .set(StorageKey::AuthToken, &tokens.access_token)
            .await?;
        self.store
            .set(StorageKey::RefreshToken, &tokens.refresh_token)
            .await?;
        debug!("Stored refreshed credential pair");
        Ok(())
    }

    /// Persist everything a successful login or signup produces
    pub async fn save_login(&self, tokens: &TokenPair, user: &User) -> Result<(), StoreError> {
        self.save_tokens(tokens).await?;
        let user_json = serde_json::to_string(user).map_err(|source| StoreError::Corrupt {
            key: StorageKey::User.as_str(),
            source,
        })?;
        self.store.set(StorageKey::User, &user_json).await?;
        self.store.set(StorageKey::IsLoggedIn, LOGGED_IN).await?;
        Ok(())
    }

    /// Remove every credential key. Keeps going past individual failures and
    /// reports the first one.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for key in StorageKey::ALL {
            if let Err(e) = self.store.remove(key).await {
                warn!(key = key.as_str(), error = %e, "Failed to remove credential");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
