use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{check_value_size, DurableStore, StoreKey};
use crate::error::StoreError;
use crate::time::UnixTimeMs;

/// SQLite-backed persistent store with one row per key.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DurableStore for SqliteStore {
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key.raw()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
        check_value_size(value)?;
        self.conn().execute(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key.raw(), value, UnixTimeMs::now().0 as i64],
        )?;
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key.raw()])?;
        Ok(removed > 0)
    }
}
