use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::ValidationError;

const MAX_ID_LENGTH: usize = 128;

fn validate_token(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::InvalidId(format!("{kind} cannot be empty")));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(ValidationError::InvalidId(format!(
            "{kind} exceeds {MAX_ID_LENGTH} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':' || c == '.')
    {
        return Err(ValidationError::InvalidId(format!(
            "{kind} contains invalid characters (allowed: a-z, A-Z, 0-9, -, _, :, .)"
        )));
    }
    Ok(())
}

fn validate_opaque(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::InvalidId(format!("{kind} cannot be empty")));
    }
    if id.len() > MAX_ID_LENGTH * 2 {
        return Err(ValidationError::InvalidId(format!(
            "{kind} exceeds {} characters",
            MAX_ID_LENGTH * 2
        )));
    }
    // Allow more characters but still reject control bytes
    if id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidId(format!(
            "{kind} contains invalid control characters"
        )));
    }
    Ok(())
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $validate:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into().trim().to_string();
                $validate(stringify!($name), &id)?;
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Client-generated placeholder identity of a write, stable until reconciled.
    TempId,
    validate_token
);
typed_id!(
    /// Authoritative identity assigned by the server.
    ServerId,
    validate_opaque
);
typed_id!(
    /// Name of a shared editable resource, e.g. `draft:42`.
    ResourceId,
    validate_opaque
);
typed_id!(
    /// Identity of one session (tab) taking part in lease coordination.
    HolderId,
    validate_token
);
typed_id!(
    /// Token sent with a commit so the server can dedup retried submissions.
    IdempotencyKey,
    validate_token
);

impl HolderId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&TempId> for IdempotencyKey {
    fn from(id: &TempId) -> Self {
        // Both share the same character rules.
        Self(id.0.clone())
    }
}

/// Pluggable id generation.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;

    fn next_temp_id(&self) -> Result<TempId, ValidationError> {
        TempId::new(self.next_id())
    }
}

/// Monotonic counter plus random suffix, e.g. `tmp-1a-9f3c01be`.
#[derive(Debug)]
pub struct RandomIds {
    prefix: String,
    counter: AtomicU64,
}

impl RandomIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new("tmp")
    }
}

impl IdSource for RandomIds {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}-{:x}-{:08x}", self.prefix, n, suffix)
    }
}

/// Reproducible ordered ids: `prefix-1`, `prefix-2`, ...
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

/// Hands out a fixed script of ids, then keeps repeating the last one.
///
/// Useful for forcing collisions.
#[derive(Debug)]
pub struct ScriptedIds {
    script: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl ScriptedIds {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(ids.into_iter().map(Into::into).collect()),
            last: Mutex::new("scripted".to_string()),
        }
    }
}

impl IdSource for ScriptedIds {
    fn next_id(&self) -> String {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(id) = next {
            *last = id;
        }
        last.clone()
    }
}
