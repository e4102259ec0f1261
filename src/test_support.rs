//! Fixtures shared by the unit tests

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::checkout::CheckOut;
use crate::config::{self, DirectoryConfig, EngineConfig, PasswordConfig};
use crate::storage::{MemoryStorage, StorageHandle};

pub const ACCOUNT: &str = "becca@example.com";

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        directory: DirectoryConfig {
            url: "ldap://127.0.0.1".to_string(),
            bind_dn: "CN=vault,CN=Users,DC=example,DC=com".to_string(),
            bind_password: "hunter2hunter2".to_string(),
            user_dn: "CN=Users,DC=example,DC=com".to_string(),
            user_attr: "userPrincipalName".to_string(),
            starttls: false,
            insecure_tls: false,
            request_timeout_secs: 5,
            last_bind_password: None,
            last_bind_password_rotation: None,
        },
        password: PasswordConfig {
            length: 14,
            formatter: String::new(),
            ttl: 100,
            max_ttl: 200,
        },
    }
}

/// In-memory storage with the engine config planted
pub async fn seeded_storage() -> StorageHandle {
    let storage: StorageHandle = Arc::new(MemoryStorage::new());
    config::write_engine_config(storage.as_ref(), &engine_config())
        .await
        .unwrap();
    storage
}

pub fn loan(due: DateTime<Utc>) -> CheckOut {
    CheckOut {
        is_available: false,
        borrower_entity_id: "entity-id".to_string(),
        borrower_client_token: "client-token".to_string(),
        lending_period: 10,
        due,
        issued_at: Utc::now(),
    }
}
