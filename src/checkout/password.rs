//! Password rotation on check-in
//!
//! A returned account gets a fresh password before it becomes available
//! again. The new password goes into the recovery log before the directory
//! is touched, so a crash or a failed remote call leaves a record the
//! reconciliation sweep can finish.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use super::{CheckOut, CheckOutHandler};
use crate::config::{self, EngineConfig};
use crate::directory::DirectoryClient;
use crate::password::generate_password;
use crate::storage::{self, Storage, StorageHandle, PASSWORD_PREFIX};
use crate::wal::{self, RotatePassword, ROTATE_PASSWORD_KIND};
use crate::{LibraryError, Result};

/// What a recovery retry did with its entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Directory and stored password updated, entry removed
    Applied,
    /// The account is no longer managed, entry removed
    Discarded,
    /// Entry already gone or not a password rotation
    Skipped,
}

fn password_key(account: &str) -> String {
    format!("{PASSWORD_PREFIX}{account}")
}

/// Rotates the account password on check-in
pub struct PasswordHandler {
    inner: Arc<dyn CheckOutHandler>,
    client: Arc<dyn DirectoryClient>,
}

impl PasswordHandler {
    pub fn new(inner: Arc<dyn CheckOutHandler>, client: Arc<dyn DirectoryClient>) -> Self {
        Self { inner, client }
    }

    /// Finish the rotation recorded in a recovery entry.
    ///
    /// The caller must hold the account's exclusive lock. On error the entry
    /// stays for the next pass.
    pub async fn retry_rotation(&self, storage: &StorageHandle, entry_id: &str) -> Result<RetryOutcome> {
        let Some(entry) = wal::get_entry(storage.as_ref(), entry_id).await? else {
            return Ok(RetryOutcome::Skipped);
        };
        if entry.kind != ROTATE_PASSWORD_KIND {
            return Ok(RetryOutcome::Skipped);
        }
        let pending: RotatePassword = entry.decode()?;
        let account = pending.service_account_name.as_str();

        match self.inner.status(storage, account).await {
            Ok(_) => {}
            Err(LibraryError::NotFound { .. }) => {
                tracing::info!(account = %account, id = %entry_id, "discarding rotation for unmanaged account");
                wal::delete_entry(storage.as_ref(), entry_id).await?;
                return Ok(RetryOutcome::Discarded);
            }
            Err(e) => return Err(e),
        }

        let engine = load_engine_config(storage).await?;
        self.apply(storage, &engine, account, pending.new_password).await?;
        self.finish(storage, account, entry_id).await?;

        tracing::info!(account = %account, id = %entry_id, "recovered pending password rotation");
        Ok(RetryOutcome::Applied)
    }

    /// Set the password in the directory, then remember it
    async fn apply(
        &self,
        storage: &StorageHandle,
        engine: &EngineConfig,
        account: &str,
        password: String,
    ) -> Result<()> {
        let secret = SecretString::from(password.clone());
        self.client
            .update_password(&engine.directory, account, &secret)
            .await?;
        storage::put_json(storage.as_ref(), &password_key(account), &password).await?;
        Ok(())
    }

    /// Drop the applied entry and any older ones for the same account,
    /// which would otherwise roll the password back on the next sweep.
    async fn finish(&self, storage: &StorageHandle, account: &str, entry_id: &str) -> Result<()> {
        let Some(applied) = wal::get_entry(storage.as_ref(), entry_id).await? else {
            return Ok(());
        };
        wal::delete_entry(storage.as_ref(), entry_id).await?;

        for id in wal::list_entries(storage.as_ref()).await? {
            let Some(entry) = wal::get_entry(storage.as_ref(), &id).await? else {
                continue;
            };
            if entry.kind != ROTATE_PASSWORD_KIND || entry.created_at > applied.created_at {
                continue;
            }
            match entry.decode::<RotatePassword>() {
                Ok(older) if older.service_account_name == account => {
                    tracing::debug!(account = %account, id = %id, "removing superseded rotation");
                    wal::delete_entry(storage.as_ref(), &id).await?;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(id = %id, error = %e, "undecodable recovery entry"),
            }
        }
        Ok(())
    }
}

/// The account's current password
pub async fn retrieve_password(storage: &StorageHandle, account: &str) -> Result<SecretString> {
    let password: Option<String> = storage::get_json(storage.as_ref(), &password_key(account)).await?;
    password.map(SecretString::from).ok_or_else(|| LibraryError::NotFound {
        account: account.to_string(),
    })
}

async fn load_engine_config(storage: &StorageHandle) -> Result<EngineConfig> {
    config::read_engine_config(storage.as_ref())
        .await?
        .ok_or(LibraryError::ConfigUnset)
}

#[async_trait]
impl CheckOutHandler for PasswordHandler {
    async fn check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        self.inner.check_out(storage, account, checkout).await
    }

    async fn renew_check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        self.inner.renew_check_out(storage, account, checkout).await
    }

    async fn check_in(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        match self.inner.status(storage, account).await {
            Ok(current) if current.is_available => {
                tracing::debug!(account = %account, "already checked in, not rotating");
                return Ok(());
            }
            Ok(_) | Err(LibraryError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let engine = load_engine_config(storage).await?;
        let password = generate_password(&engine.password.formatter, engine.password.length)?;

        let entry_id = wal::put_entry(
            storage.as_ref(),
            ROTATE_PASSWORD_KIND,
            &RotatePassword {
                service_account_name: account.to_string(),
                new_password: password.clone(),
            },
        )
        .await?;

        if let Err(e) = self.apply(storage, &engine, account, password).await {
            tracing::warn!(
                account = %account,
                id = %entry_id,
                error = %e,
                "password rotation failed, account stays checked out"
            );
            return Err(e);
        }
        self.finish(storage, account, &entry_id).await?;

        self.inner.check_in(storage, account).await?;
        tracing::info!(account = %account, "checked in with new password");
        Ok(())
    }

    async fn status(&self, storage: &StorageHandle, account: &str) -> Result<CheckOut> {
        self.inner.status(storage, account).await
    }

    async fn delete(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        storage.delete(&password_key(account)).await?;
        self.inner.delete(storage, account).await
    }
}
