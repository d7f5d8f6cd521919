//! Persisted session credentials.
//!
//! The [`CredentialStore`] owns the access/refresh token pair and the
//! current-user record. It keeps nothing in memory: every [`get`] re-reads
//! the backing [`CredentialStorage`], because other parts of the host
//! application may write tokens directly.
//!
//! [`get`]: CredentialStore::get

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage key for the bearer token.
pub const ACCESS_TOKEN_KEY: &str = "token";
/// Storage key for the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
/// Storage key for the token lifetime, in seconds.
pub const EXPIRES_IN_KEY: &str = "tokenExpiresIn";
/// Storage key for the serialized current-user record.
pub const USER_KEY: &str = "user";

/// An access/refresh token pair.
///
/// Token values are hidden from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_seconds: u64,
}

impl Session {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in_seconds: u64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_in_seconds,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in_seconds", &self.expires_in_seconds)
            .finish()
    }
}

/// Failure of the storage medium.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] std::io::Error),

    #[error("storage corrupted: {0}")]
    Corrupted(#[from] serde_json::Error),
}

/// Key-value contract for the medium that persists credentials.
///
/// Implementations must be cheap to call repeatedly; the store reads
/// through on every access.
pub trait CredentialStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local storage. The default when nothing else is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Storage backed by a single JSON object on disk.
///
/// The file is read on every access so that edits made by other processes
/// are picked up. A missing file reads as empty.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) if json.trim().is_empty() => Ok(HashMap::new()),
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }
}

impl CredentialStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

/// Shared handle to the persisted session.
///
/// Multi-key reads and writes are serialized so no reader observes a
/// half-written session. Every `set` and `clear` advances an epoch, which
/// lets a refresh that started under one session detect that the session
/// has since ended or been replaced.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn CredentialStorage>,
    epoch: Arc<Mutex<u64>>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        Self {
            storage,
            epoch: Arc::new(Mutex::new(0)),
        }
    }

    /// Reads the current session from storage.
    ///
    /// Returns `None` if either token is missing or empty, or if the medium
    /// cannot be read.
    pub fn get(&self) -> Option<Session> {
        let _epoch = self.epoch.lock();
        self.read_session()
    }

    /// Reads the session together with the epoch it belongs to.
    pub(crate) fn snapshot(&self) -> (u64, Option<Session>) {
        let epoch = self.epoch.lock();
        (*epoch, self.read_session())
    }

    /// Persists a session, replacing any previous one.
    pub fn set(&self, session: &Session) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.write_session(session);
    }

    /// Persists `session` only if nothing has set or cleared the store since
    /// `expected` was observed. Returns whether it was written.
    pub(crate) fn set_if_current(&self, expected: u64, session: &Session) -> bool {
        let mut epoch = self.epoch.lock();
        if *epoch != expected {
            return false;
        }
        *epoch += 1;
        self.write_session(session);
        true
    }

    /// Removes the session and the current-user record.
    pub fn clear(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.delete_all();
    }

    /// Like [`clear`](Self::clear), skipped if the store changed since
    /// `expected` was observed.
    pub(crate) fn clear_if_current(&self, expected: u64) -> bool {
        let mut epoch = self.epoch.lock();
        if *epoch != expected {
            return false;
        }
        *epoch += 1;
        self.delete_all();
        true
    }

    fn read_session(&self) -> Option<Session> {
        let access_token = self.read(ACCESS_TOKEN_KEY)?;
        let refresh_token = self.read(REFRESH_TOKEN_KEY).unwrap_or_default();
        let expires_in_seconds = self
            .read(EXPIRES_IN_KEY)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        Some(Session {
            access_token,
            refresh_token,
            expires_in_seconds,
        })
    }

    fn write_session(&self, session: &Session) {
        self.write(ACCESS_TOKEN_KEY, &session.access_token);
        self.write(REFRESH_TOKEN_KEY, &session.refresh_token);
        self.write(EXPIRES_IN_KEY, &session.expires_in_seconds.to_string());
    }

    fn delete_all(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_IN_KEY, USER_KEY] {
            if let Err(e) = self.storage.delete(key) {
                tracing::error!(error = %e, key = key, "Failed to delete credential");
            }
        }
    }

    /// Reads the current-user record, if one was stored and is valid JSON.
    pub fn current_user<U>(&self) -> Option<U>
    where
        U: serde::de::DeserializeOwned,
    {
        let raw = self.read(USER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable user record");
                None
            }
        }
    }

    pub fn set_current_user<U: Serialize>(&self, user: &U) {
        match serde_json::to_string(user) {
            Ok(json) => self.write(USER_KEY, &json),
            Err(e) => tracing::error!(error = %e, "Failed to serialize user record"),
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.read(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, key = key, "Credential storage unavailable");
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.storage.write(key, value) {
            tracing::error!(error = %e, key = key, "Failed to persist credential");
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}
