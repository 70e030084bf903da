use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::storage::kv_store::{KeyValueStore, StoreError};

const DATA_DIR_NAME: &str = "spotlight";

/// Durable key/value area backed by SQLite.
pub struct DbManager {
    conn: Mutex<Connection>,
}

impl DbManager {
    /// Opens (or creates) the database under the platform data directory.
    pub fn new(data_dir_override: Option<&Path>, file_name: &str) -> Result<Self, StoreError> {
        let data_dir = match data_dir_override {
            Some(dir) => dir.to_path_buf(),
            None => Self::default_data_dir()?,
        };
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir).map_err(|error| {
                StoreError::Backend(format!(
                    "could not create data directory {}: {error}",
                    data_dir.display()
                ))
            })?;
        }
        let conn = Connection::open(data_dir.join(file_name))?;
        Self::from_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn default_data_dir() -> Result<PathBuf, StoreError> {
        dirs::data_dir()
            .map(|dir| dir.join(DATA_DIR_NAME))
            .ok_or_else(|| StoreError::Backend("could not find data directory".to_string()))
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let db_manager = Self {
            conn: Mutex::new(conn),
        };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("database lock poisoned".to_string()))
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

impl KeyValueStore for DbManager {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .lock()?
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, crate::now_unix_ms()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn area_name(&self) -> &'static str {
        "durable"
    }
}
