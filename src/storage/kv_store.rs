//! Minimal key/value persistence seam shared by the durable and session areas.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Failure at the storage boundary. Callers treat reads that fail as misses.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to encode record: {0}")]
    Encode(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Backend(error.to_string())
    }
}

/// String key/value area. Implementations must be safe to share between threads.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// Short label used in log lines.
    fn area_name(&self) -> &'static str;
}

/// Process-lifetime area. Survives rebuilds, not restarts.
#[derive(Default)]
pub struct SessionKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl SessionKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("session store lock poisoned".to_string()))
    }
}

impl KeyValueStore for SessionKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn area_name(&self) -> &'static str {
        "session"
    }
}

/// Area used when no backend is available. Reads always miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullKvStore;

impl KeyValueStore for NullKvStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn area_name(&self) -> &'static str {
        "none"
    }
}
