use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{check_value_size, DurableStore, StoreKey};
use crate::error::StoreError;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_FILE_BYTES: usize = super::MAX_VALUE_SIZE + 64 * 1024;
const STORE_MAGIC: &[u8; 4] = b"WSKV";

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    key: String,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

/// Directory-backed store: one checksummed CBOR envelope per key.
///
/// Writes go to a temp file that is synced and renamed over the target, so a
/// crash leaves either the old or the new value, never a torn one.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StoreKey) -> PathBuf {
        self.dir.join(format!("{}.bin", hex::encode(key.raw())))
    }

    fn encode(key: &StoreKey, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        let checksum = blake3::hash(value);
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            key: key.raw(),
            checksum: *checksum.as_bytes(),
            payload: value.to_vec(),
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;
        Ok(bytes)
    }

    fn decode(key: &StoreKey, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty file",
            });
        }
        if bytes.len() > MAX_FILE_BYTES {
            return Err(StoreError::ValueTooLarge {
                size: bytes.len(),
                max: MAX_FILE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        if envelope.key != key.raw() {
            return Err(StoreError::Corrupted {
                reason: "envelope belongs to a different key",
            });
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        Ok(envelope.payload)
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(key, &bytes).map(Some)
    }

    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        check_value_size(value)?;
        let encoded = Self::encode(key, value)?;

        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        fs::rename(&tmp_path, &path)?;

        if let Ok(dir) = File::open(&self.dir) {
            if let Err(e) = dir.sync_all() {
                warn!(error = %e, "directory sync failed");
            }
        }

        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
