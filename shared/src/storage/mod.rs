//! Durable key-value storage used to persist session state.
//!
//! Every implementation stores opaque bytes under a validated [`StoreKey`].
//! [`TypedSlot`] layers JSON (de)serialization on top for callers that keep
//! one structured value per key.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

mod file;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use self::file::FileStore;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStore;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyNamespace {
    Outbox,
    Locks,
    Cache,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Outbox => "outbox",
            KeyNamespace::Locks => "locks",
            KeyNamespace::Cache => "cache",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom namespace cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace exceeds maximum length of {} bytes",
                    MAX_PREFIX_LENGTH
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    namespace: KeyNamespace,
    key: String,
}

impl StoreKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), StoreError> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains("..") {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(StoreError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

/// Durable per-session key-value store.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError>;
    /// Returns whether a value existed.
    fn remove(&self, key: &StoreKey) -> Result<bool, StoreError>;
}

impl<S: DurableStore + ?Sized> DurableStore for Arc<S> {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &StoreKey) -> Result<bool, StoreError> {
        (**self).remove(key)
    }
}

fn check_value_size(value: &[u8]) -> Result<(), StoreError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(StoreError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Volatile store, lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&key.raw()).cloned())
    }

    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        check_value_size(value)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.raw(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(&key.raw()).is_some())
    }
}

/// One JSON-encoded value of type `T` kept under a fixed key.
#[derive(Debug, Clone)]
pub struct TypedSlot<T> {
    key: StoreKey,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> TypedSlot<T> {
    pub fn new(key: StoreKey) -> Self {
        Self {
            key,
            _phantom: PhantomData,
        }
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn load<S: DurableStore + ?Sized>(&self, store: &S) -> Result<Option<T>, StoreError> {
        match store.get(&self.key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save<S: DurableStore + ?Sized>(&self, store: &S, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        store.set(&self.key, &bytes)
    }

    pub fn clear<S: DurableStore + ?Sized>(&self, store: &S) -> Result<bool, StoreError> {
        store.remove(&self.key)
    }
}
