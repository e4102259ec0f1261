//! Recovery log
//!
//! An entry records an intended side effect before it is attempted and is
//! deleted once the effect is confirmed. Whatever is still listed after a
//! crash or a failed remote call is work the reconciliation sweep retries.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{self, Storage, StorageError, WAL_PREFIX};

/// Kind used for pending service account password rotations
pub const ROTATE_PASSWORD_KIND: &str = "rotate-password";

/// A durable intent record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalEntry {
    pub id: String,
    pub kind: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WalEntry {
    /// Decode the payload into its concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Payload of a [`ROTATE_PASSWORD_KIND`] entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotatePassword {
    pub service_account_name: String,
    pub new_password: String,
}

/// Kind used for pending static role rotations
pub const ROTATE_ROLE_KIND: &str = "rotate-role";

/// Payload of a [`ROTATE_ROLE_KIND`] entry: the role state to reach once the
/// directory holds `current_password`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotateRole {
    pub role_name: String,
    pub service_account_name: String,
    pub ttl: u64,
    pub current_password: String,
    #[serde(default)]
    pub last_password: Option<String>,
    pub rotated_at: DateTime<Utc>,
}

fn entry_key(id: &str) -> String {
    format!("{WAL_PREFIX}{id}")
}

/// Write an entry and return its id
pub async fn put_entry<T: Serialize>(
    storage: &dyn Storage,
    kind: &str,
    data: &T,
) -> Result<String, StorageError> {
    let entry = WalEntry {
        id: Uuid::new_v4().to_string(),
        kind: kind.to_string(),
        data: serde_json::to_value(data)?,
        created_at: Utc::now(),
    };
    storage::put_json(storage, &entry_key(&entry.id), &entry).await?;
    tracing::debug!(id = %entry.id, kind = %kind, "recovery entry written");
    Ok(entry.id)
}

pub async fn get_entry(storage: &dyn Storage, id: &str) -> Result<Option<WalEntry>, StorageError> {
    storage::get_json(storage, &entry_key(id)).await
}

/// Ids of every entry, oldest first
pub async fn list_entries(storage: &dyn Storage) -> Result<Vec<String>, StorageError> {
    let mut entries = Vec::new();
    for id in storage.list(WAL_PREFIX).await? {
        // deleted between list and get
        if let Some(entry) = get_entry(storage, &id).await? {
            entries.push(entry);
        }
    }
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(entries.into_iter().map(|e| e.id).collect())
}

pub async fn delete_entry(storage: &dyn Storage, id: &str) -> Result<(), StorageError> {
    storage.delete(&entry_key(id)).await?;
    tracing::debug!(id = %id, "recovery entry deleted");
    Ok(())
}
