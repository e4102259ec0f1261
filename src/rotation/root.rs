//! Root (bind DN) credential rotation
//!
//! The new password is set in the directory first and persisted second. If
//! persisting fails the directory is put back to the old password, since
//! otherwise nothing we store could bind any more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use super::RotationError;
use crate::alerting::{AlertSeverity, Alerter};
use crate::config::{self, DirectoryConfig, EngineConfig};
use crate::directory::DirectoryClient;
use crate::password::generate_password;
use crate::storage::StorageHandle;
use crate::{LibraryError, Result};

pub struct RootRotator {
    client: Arc<dyn DirectoryClient>,
    alerter: Arc<dyn Alerter>,
    in_progress: AtomicBool,
    rollback_attempts: u32,
    backoff_unit: Duration,
}

/// Clears the in-progress flag however rotation ends
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RootRotator {
    pub fn new(
        client: Arc<dyn DirectoryClient>,
        alerter: Arc<dyn Alerter>,
        rollback_attempts: u32,
        backoff_unit: Duration,
    ) -> Self {
        Self {
            client,
            alerter,
            in_progress: AtomicBool::new(false),
            rollback_attempts,
            backoff_unit,
        }
    }

    /// Rotate the bind password. `cancel` aborts a rollback that is waiting
    /// to retry.
    pub async fn rotate(&self, storage: &StorageHandle, cancel: &CancellationToken) -> Result<()> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            tracing::warn!("root credential rotation already in progress");
            return Err(RotationError::InProgress.into());
        }
        let _flag = InProgress(&self.in_progress);

        let engine = config::read_engine_config(storage.as_ref())
            .await?
            .ok_or(LibraryError::ConfigUnset)?;
        let new_password = generate_password(&engine.password.formatter, engine.password.length)?;
        let bind_dn = engine.directory.bind_dn.clone();

        self.client
            .update_root_password(&engine.directory, &bind_dn, &SecretString::from(new_password.clone()))
            .await?;

        let mut rotated: EngineConfig = engine.clone();
        rotated.directory.last_bind_password = Some(engine.directory.bind_password.clone());
        rotated.directory.last_bind_password_rotation = Some(Utc::now());
        rotated.directory.bind_password = new_password;

        let store_error = match config::write_engine_config(storage.as_ref(), &rotated).await {
            Ok(()) => {
                tracing::info!(bind_dn = %bind_dn, "root credential rotated");
                return Ok(());
            }
            Err(e) => e,
        };

        tracing::error!(bind_dn = %bind_dn, error = %store_error, "failed to store new root password, rolling back");
        // the directory now only accepts the new password
        let mut conn = rotated.directory.clone();
        conn.last_bind_password = None;
        match self
            .roll_back(&conn, &bind_dn, &engine.directory.bind_password, cancel)
            .await
        {
            Ok(()) => {
                tracing::warn!(bind_dn = %bind_dn, "root password rolled back");
                Err(store_error.into())
            }
            Err(rollback_error) => {
                let err = LibraryError::RootRollbackFailed {
                    store_error: store_error.to_string(),
                    rollback_error: rollback_error.to_string(),
                };
                tracing::error!(bind_dn = %bind_dn, error = %err, "root password rollback failed");
                self.alerter.alert(&err.to_string(), AlertSeverity::Critical);
                Err(err)
            }
        }
    }

    /// Try to restore `old_password`, waiting `i^2` backoff units after the
    /// i-th failure
    async fn roll_back(
        &self,
        conn: &DirectoryConfig,
        bind_dn: &str,
        old_password: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let secret = SecretString::from(old_password.to_string());
        let mut last_error = LibraryError::Internal("no rollback attempted".to_string());

        for attempt in 1..=self.rollback_attempts {
            match self.client.update_root_password(conn, bind_dn, &secret).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "root password rollback attempt failed");
                    last_error = e.into();
                }
            }
            if attempt == self.rollback_attempts {
                break;
            }

            let wait = self.backoff_unit * attempt * attempt;
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LibraryError::Internal(format!(
                        "rollback cancelled after {attempt} attempt(s): {last_error}"
                    )));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::mock::RecordingAlerter;
    use crate::directory::mock::FakeDirectoryClient;
    use crate::storage::{MemoryStorage, Storage, StorageError, CONFIG_KEY};
    use crate::test_support::engine_config;
    use async_trait::async_trait;

    /// Memory storage whose engine config writes can be made to fail
    #[derive(Default)]
    struct FlakyConfigStorage {
        inner: MemoryStorage,
        fail_config_writes: AtomicBool,
    }

    #[async_trait]
    impl Storage for FlakyConfigStorage {
        async fn get(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str) -> std::result::Result<(), StorageError> {
            if key == CONFIG_KEY && self.fail_config_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }
    }

    struct Fixture {
        flaky: Arc<FlakyConfigStorage>,
        storage: StorageHandle,
        client: Arc<FakeDirectoryClient>,
        alerter: Arc<RecordingAlerter>,
        rotator: RootRotator,
    }

    async fn fixture() -> Fixture {
        let flaky = Arc::new(FlakyConfigStorage::default());
        config::write_engine_config(flaky.as_ref(), &engine_config())
            .await
            .unwrap();
        let client = Arc::new(FakeDirectoryClient::new());
        let alerter = Arc::new(RecordingAlerter::new());
        let rotator = RootRotator::new(client.clone(), alerter.clone(), 3, Duration::from_millis(1));
        Fixture {
            storage: flaky.clone(),
            flaky,
            client,
            alerter,
            rotator,
        }
    }

    async fn stored(storage: &StorageHandle) -> EngineConfig {
        config::read_engine_config(storage.as_ref()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_rotation_persists_new_password() {
        let f = fixture().await;
        f.rotator.rotate(&f.storage, &CancellationToken::new()).await.unwrap();

        let engine = stored(&f.storage).await;
        let original = engine_config().directory.bind_password;
        assert_ne!(engine.directory.bind_password, original);
        assert_eq!(engine.directory.last_bind_password.as_deref(), Some(original.as_str()));
        assert!(engine.directory.last_bind_password_rotation.is_some());
        assert_eq!(f.client.root_passwords(), vec![engine.directory.bind_password]);
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back() {
        let f = fixture().await;
        f.flaky.fail_config_writes.store(true, Ordering::SeqCst);

        let err = f.rotator.rotate(&f.storage, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LibraryError::Storage(_)));

        let original = engine_config().directory.bind_password;
        let history = f.client.root_passwords();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], original);
        assert_eq!(stored(&f.storage).await.directory.bind_password, original);
        assert!(f.alerter.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_critical() {
        let f = fixture().await;
        f.flaky.fail_config_writes.store(true, Ordering::SeqCst);

        // first update goes through, every rollback attempt fails
        struct FailAfterFirst(Arc<FakeDirectoryClient>);

        #[async_trait]
        impl DirectoryClient for FailAfterFirst {
            async fn update_password(
                &self,
                conf: &DirectoryConfig,
                account: &str,
                password: &SecretString,
            ) -> std::result::Result<(), crate::directory::DirectoryError> {
                self.0.update_password(conf, account, password).await
            }

            async fn update_root_password(
                &self,
                conf: &DirectoryConfig,
                bind_dn: &str,
                password: &SecretString,
            ) -> std::result::Result<(), crate::directory::DirectoryError> {
                let result = self.0.update_root_password(conf, bind_dn, password).await;
                self.0.fail_root_updates(true);
                result
            }

            async fn enable_account(
                &self,
                conf: &DirectoryConfig,
                account: &str,
            ) -> std::result::Result<(), crate::directory::DirectoryError> {
                self.0.enable_account(conf, account).await
            }

            async fn disable_account(
                &self,
                conf: &DirectoryConfig,
                account: &str,
            ) -> std::result::Result<(), crate::directory::DirectoryError> {
                self.0.disable_account(conf, account).await
            }

            async fn password_last_set(
                &self,
                conf: &DirectoryConfig,
                account: &str,
            ) -> std::result::Result<chrono::DateTime<Utc>, crate::directory::DirectoryError> {
                self.0.password_last_set(conf, account).await
            }
        }

        let client = Arc::new(FailAfterFirst(f.client.clone()));
        let rotator = RootRotator::new(client, f.alerter.clone(), 3, Duration::from_millis(1));

        let err = rotator.rotate(&f.storage, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LibraryError::RootRollbackFailed { .. }));
        assert_eq!(f.alerter.count(AlertSeverity::Critical), 1);
        assert_eq!(f.client.root_passwords().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_rollback_stops_retrying() {
        let f = fixture().await;
        f.flaky.fail_config_writes.store(true, Ordering::SeqCst);
        let rotator = RootRotator::new(f.client.clone(), f.alerter.clone(), 10, Duration::from_secs(3600));

        let engine = stored(&f.storage).await;
        f.client.fail_root_updates(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = rotator
            .roll_back(&engine.directory, &engine.directory.bind_dn, "old-password-1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::Internal(_)));
        assert!(err.to_string().contains("1 attempt"));
    }

    #[tokio::test]
    async fn test_missing_engine_config() {
        let f = fixture().await;
        let empty: StorageHandle = Arc::new(MemoryStorage::new());
        let err = f.rotator.rotate(&empty, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LibraryError::ConfigUnset));
        assert!(f.client.root_passwords().is_empty());

        // the flag was released
        f.rotator.rotate(&f.storage, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_rotation_at_a_time() {
        let f = fixture().await;
        f.rotator.in_progress.store(true, Ordering::SeqCst);
        let err = f.rotator.rotate(&f.storage, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, LibraryError::Rotation(RotationError::InProgress)));
    }
}
