//! Durable key-value storage for checkouts, passwords, sets and the recovery log
//!
//! Every persisted record is a JSON document under a string key. The storage
//! guarantees per-key atomicity only; cross-key consistency is the job of the
//! per-account locks in [`crate::checkout`].

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Key prefix for checkout records
pub const CHECKOUT_PREFIX: &str = "checkout/";
/// Key prefix for persisted account passwords
pub const PASSWORD_PREFIX: &str = "password/";
/// Key prefix for library sets
pub const LIBRARY_PREFIX: &str = "library/";
/// Key prefix for static roles
pub const ROLE_PREFIX: &str = "role/";
/// Key prefix for static role credentials
pub const CREDS_PREFIX: &str = "creds/";
/// Key prefix for recovery log entries
pub const WAL_PREFIX: &str = "wal/";
/// Key holding the engine configuration
pub const CONFIG_KEY: &str = "config";

/// Errors that can occur in storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed record at {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage trait for persisted records
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get a value by key, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Create or overwrite a value
    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List keys under a prefix, with the prefix stripped, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Shared handle to a storage implementation
pub type StorageHandle = Arc<dyn Storage>;

/// Read and decode a JSON record
pub async fn get_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageError::Malformed {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode and write a JSON record
pub async fn put_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    storage.put(key, &raw).await
}
