//! Session-key persistence.
//!
//! The session key is the only thing the client remembers across
//! processes. It lives in a fixed file under the user's home directory
//! so a restarted widget host can resume its relay session without
//! pairing again.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOG_TARGET: &str = "pontoon::store";
const STORE_DIR: &str = ".pontoon";
const STORE_FILE: &str = "session.toml";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored session is unreadable: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("session could not be serialised: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Where the client keeps the session key between runs.
pub trait KeyStore: Send + Sync {
    fn load(&self) -> Result<Option<String>, StoreError>;
    fn save(&self, key: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    key: String,
}

/// Key store backed by `~/.pontoon/session.toml`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location under the user's home directory.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let base = BaseDirs::new().ok_or(StoreError::NoHome)?;
        Ok(base.home_dir().join(STORE_DIR).join(STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let stored: StoredSession = toml::from_str(&raw)?;
        Ok(Some(stored.key))
    }

    fn save(&self, key: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = toml::to_string(&StoredSession {
            key: key.to_string(),
        })?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        // The key grants relay access; keep the file owner-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        debug!(target: LOG_TARGET, path = %self.path.display(), "session key saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(target: LOG_TARGET, path = %self.path.display(), "stored session key removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for tests and embedders that manage keys themselves.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Mutex::new(Some(key.into())),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self.key.lock().clone())
    }

    fn save(&self, key: &str) -> Result<(), StoreError> {
        *self.key.lock() = Some(key.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.key.lock() = None;
        Ok(())
    }
}
