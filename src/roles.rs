//! Static roles
//!
//! A static role pins one service account whose password is rotated on a
//! schedule instead of per loan. Reading the role's credentials hands out
//! the current and the previous password; when the role's TTL has passed
//! since the last rotation, the read rotates first.
//!
//! Rotations go through the recovery log the same way check-in rotations
//! do, so a failed directory call is finished by the reconciliation sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::checkout::{validate_account_name, KeyedLocks, RetryOutcome};
use crate::config::{self, EngineConfig, PasswordConfig};
use crate::directory::DirectoryClient;
use crate::library::normalize_set_name;
use crate::password::generate_password;
use crate::storage::{self, StorageHandle, CREDS_PREFIX, ROLE_PREFIX};
use crate::wal::{self, RotateRole, ROTATE_ROLE_KIND};
use crate::{LibraryError, Result};

/// Stored at `role/<name>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticRole {
    pub service_account_name: String,
    /// Rotation period in seconds
    pub ttl: u64,
    /// When we last set the password, `None` until the first credential read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_vault_rotation: Option<DateTime<Utc>>,
    /// The directory's own record of the last password change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_last_set: Option<DateTime<Utc>>,
}

impl StaticRole {
    /// Whether credentials read at `now` must be rotated first
    pub fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_vault_rotation {
            None => true,
            Some(last) => now >= last + chrono::Duration::seconds(self.ttl as i64),
        }
    }
}

/// Fields of a role write. `None` keeps the current value on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleParams {
    #[serde(default)]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// Stored at `creds/<role>`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredentials {
    username: String,
    current_password: String,
    #[serde(default)]
    last_password: Option<String>,
}

/// Credentials handed out for a role
#[derive(Debug, Clone)]
pub struct RoleCredentials {
    /// Account name without the `@domain` part
    pub username: String,
    pub current_password: SecretString,
    /// The password before the last rotation, for clients still using it
    pub last_password: Option<SecretString>,
}

impl From<StoredCredentials> for RoleCredentials {
    fn from(stored: StoredCredentials) -> Self {
        Self {
            username: stored.username,
            current_password: SecretString::from(stored.current_password),
            last_password: stored.last_password.map(SecretString::from),
        }
    }
}

/// The role TTL: the requested one, else the engine default. Must be
/// positive and within the engine's max TTL.
pub fn validated_ttl(policy: &PasswordConfig, requested: Option<u64>) -> Result<u64> {
    let ttl = requested.unwrap_or(policy.ttl);
    if ttl < 1 {
        return Err(LibraryError::Validation("ttl must be at least 1 second".to_string()));
    }
    if policy.max_ttl > 0 && ttl > policy.max_ttl {
        return Err(LibraryError::Validation(format!(
            "requested ttl of {ttl} seconds is over the max ttl of {} seconds",
            policy.max_ttl
        )));
    }
    Ok(ttl)
}

/// `my_app@example.com` logs in as `my_app`
pub fn username(service_account_name: &str) -> Result<&str> {
    match service_account_name.split('@').next() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(LibraryError::Validation(format!(
            "unable to derive a username from {service_account_name:?}"
        ))),
    }
}

fn role_key(name: &str) -> String {
    format!("{ROLE_PREFIX}{name}")
}

fn creds_key(name: &str) -> String {
    format!("{CREDS_PREFIX}{name}")
}

/// Static role CRUD and lazily rotated credentials
pub struct RoleManager {
    storage: StorageHandle,
    client: Arc<dyn DirectoryClient>,
    locks: KeyedLocks,
}

impl RoleManager {
    pub fn new(storage: StorageHandle, client: Arc<dyn DirectoryClient>) -> Self {
        Self {
            storage,
            client,
            locks: KeyedLocks::new(),
        }
    }

    async fn engine(&self) -> Result<EngineConfig> {
        config::read_engine_config(self.storage.as_ref())
            .await?
            .ok_or(LibraryError::ConfigUnset)
    }

    async fn load_role(&self, name: &str) -> Result<Option<StaticRole>> {
        Ok(storage::get_json(self.storage.as_ref(), &role_key(name)).await?)
    }

    async fn require_role(&self, name: &str) -> Result<StaticRole> {
        self.load_role(name).await?.ok_or_else(|| LibraryError::RoleNotFound {
            name: name.to_string(),
        })
    }

    /// Create a role, or update the fields given. A new account is looked
    /// up in the directory first, so typos fail here rather than at the
    /// first credential read.
    pub async fn write_role(&self, name: &str, params: RoleParams) -> Result<StaticRole> {
        let name = normalize_set_name(name)?;
        let _guard = self.locks.write(&name).await;
        let engine = self.engine().await?;

        let mut role = match self.load_role(&name).await? {
            Some(role) => role,
            None => {
                let account = params.service_account_name.clone().ok_or_else(|| {
                    LibraryError::Validation("\"service_account_name\" is required".to_string())
                })?;
                StaticRole {
                    service_account_name: account,
                    ttl: engine.password.ttl,
                    last_vault_rotation: None,
                    password_last_set: None,
                }
            }
        };

        role.ttl = validated_ttl(&engine.password, Some(params.ttl.unwrap_or(role.ttl)))?;

        let account_changed = params
            .service_account_name
            .as_ref()
            .is_some_and(|account| *account != role.service_account_name);
        if account_changed || role.password_last_set.is_none() {
            if let Some(account) = params.service_account_name {
                role.service_account_name = account;
            }
            validate_account_name(&role.service_account_name)?;
            username(&role.service_account_name)?;

            role.password_last_set = Some(
                self.client
                    .password_last_set(&engine.directory, &role.service_account_name)
                    .await?,
            );
            if account_changed {
                // the stored credentials belong to the old account
                role.last_vault_rotation = None;
                self.storage.delete(&creds_key(&name)).await?;
            }
        }

        storage::put_json(self.storage.as_ref(), &role_key(&name), &role).await?;
        tracing::info!(role = %name, account = %role.service_account_name, ttl = role.ttl, "wrote role");
        Ok(role)
    }

    pub async fn read_role(&self, name: &str) -> Result<StaticRole> {
        let name = normalize_set_name(name)?;
        let _guard = self.locks.read(&name).await;
        self.require_role(&name).await
    }

    pub async fn list_roles(&self) -> Result<Vec<String>> {
        Ok(self.storage.list(ROLE_PREFIX).await?)
    }

    /// Forget the role and its credentials. The directory account is left
    /// with its current password.
    pub async fn delete_role(&self, name: &str) -> Result<()> {
        let name = normalize_set_name(name)?;
        let _guard = self.locks.write(&name).await;
        self.storage.delete(&creds_key(&name)).await?;
        self.storage.delete(&role_key(&name)).await?;
        tracing::info!(role = %name, "deleted role");
        Ok(())
    }

    /// Current credentials, rotating first if none are stored yet or the
    /// role's TTL has passed
    pub async fn read_creds(&self, name: &str) -> Result<RoleCredentials> {
        let name = normalize_set_name(name)?;
        let _guard = self.locks.write(&name).await;

        let role = self.require_role(&name).await?;
        let stored: Option<StoredCredentials> = storage::get_json(self.storage.as_ref(), &creds_key(&name)).await?;

        match stored {
            Some(stored) if !role.rotation_due(Utc::now()) => Ok(stored.into()),
            stored => {
                tracing::debug!(role = %name, unset = stored.is_none(), "rotating role credentials");
                self.rotate(&name, &role, stored).await
            }
        }
    }

    /// Rotate now regardless of the TTL
    pub async fn rotate_role(&self, name: &str) -> Result<RoleCredentials> {
        let name = normalize_set_name(name)?;
        let _guard = self.locks.write(&name).await;

        let role = self.require_role(&name).await?;
        let stored: Option<StoredCredentials> = storage::get_json(self.storage.as_ref(), &creds_key(&name)).await?;
        self.rotate(&name, &role, stored).await
    }

    async fn rotate(
        &self,
        name: &str,
        role: &StaticRole,
        previous: Option<StoredCredentials>,
    ) -> Result<RoleCredentials> {
        let engine = self.engine().await?;
        let pending = RotateRole {
            role_name: name.to_string(),
            service_account_name: role.service_account_name.clone(),
            ttl: role.ttl,
            current_password: generate_password(&engine.password.formatter, engine.password.length)?,
            last_password: previous.map(|c| c.current_password),
            rotated_at: Utc::now(),
        };

        let entry_id = wal::put_entry(self.storage.as_ref(), ROTATE_ROLE_KIND, &pending).await?;
        let stored = match self.apply(&engine, &pending).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(role = %name, id = %entry_id, error = %e, "role rotation failed");
                return Err(e);
            }
        };
        wal::delete_entry(self.storage.as_ref(), &entry_id).await?;

        tracing::info!(role = %name, account = %role.service_account_name, "rotated role password");
        Ok(stored.into())
    }

    /// Push the password to the directory, then persist the role and its
    /// credentials as the entry describes them
    async fn apply(&self, engine: &EngineConfig, pending: &RotateRole) -> Result<StoredCredentials> {
        let account = pending.service_account_name.as_str();
        self.client
            .update_password(
                &engine.directory,
                account,
                &SecretString::from(pending.current_password.clone()),
            )
            .await?;

        let password_last_set = match self.client.password_last_set(&engine.directory, account).await {
            Ok(at) => Some(at),
            Err(e) => {
                tracing::warn!(account = %account, error = %e, "couldn't read password last set");
                None
            }
        };

        let role = StaticRole {
            service_account_name: pending.service_account_name.clone(),
            ttl: pending.ttl,
            last_vault_rotation: Some(pending.rotated_at),
            password_last_set,
        };
        let stored = StoredCredentials {
            username: username(account)?.to_string(),
            current_password: pending.current_password.clone(),
            last_password: pending.last_password.clone(),
        };

        storage::put_json(self.storage.as_ref(), &role_key(&pending.role_name), &role).await?;
        storage::put_json(self.storage.as_ref(), &creds_key(&pending.role_name), &stored).await?;
        Ok(stored)
    }

    /// Finish a role rotation left in the recovery log. Entries for deleted
    /// roles, re-pointed roles, or rotations a later one already replaced
    /// are discarded.
    pub async fn retry_rotation(&self, entry_id: &str) -> Result<RetryOutcome> {
        let Some(entry) = wal::get_entry(self.storage.as_ref(), entry_id).await? else {
            return Ok(RetryOutcome::Skipped);
        };
        if entry.kind != ROTATE_ROLE_KIND {
            return Ok(RetryOutcome::Skipped);
        }
        let pending: RotateRole = entry.decode()?;
        let _guard = self.locks.write(&pending.role_name).await;

        let stale = match self.load_role(&pending.role_name).await? {
            None => true,
            Some(role) => {
                role.service_account_name != pending.service_account_name
                    || role.last_vault_rotation.is_some_and(|last| last > pending.rotated_at)
            }
        };
        if stale {
            tracing::info!(role = %pending.role_name, id = %entry_id, "discarding stale role rotation");
            wal::delete_entry(self.storage.as_ref(), entry_id).await?;
            return Ok(RetryOutcome::Discarded);
        }

        let engine = self.engine().await?;
        self.apply(&engine, &pending).await?;
        wal::delete_entry(self.storage.as_ref(), entry_id).await?;

        tracing::info!(role = %pending.role_name, id = %entry_id, "recovered pending role rotation");
        Ok(RetryOutcome::Applied)
    }
}
