//! SQLite storage implementation
//!
//! A single `kv` table keyed by the record path. Each write is one statement,
//! which gives the per-key atomicity the checkout core relies on.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Storage, StorageError};

/// Storage backed by a SQLite database file
pub struct SqliteStorage {
    /// Database connection (Mutex because Connection is Send but not Sync)
    db: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at the given path
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL")?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let db = self.db.lock().unwrap();
        let value = db
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let db = self.db.lock().unwrap();
        db.execute(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        tracing::trace!(key = key, "stored record");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM kv WHERE key = ?", [key])?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let db = self.db.lock().unwrap();

        // substr avoids LIKE wildcards in account names
        let mut stmt = db.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;

        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|k| k.strip_prefix(prefix).map(str::to_string))
            .collect();

        Ok(keys)
    }
}
