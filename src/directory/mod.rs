//! Directory client for the managed service accounts
//!
//! The checkout core only needs to set passwords. Enable/disable and
//! password-age lookups are part of the contract so operators can wire
//! account lifecycle tooling against the same client.

mod ldap;

pub use ldap::LdapClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use thiserror::Error;

use crate::config::DirectoryConfig;

/// Errors returned by the directory
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("account not found in directory: {account}")]
    AccountNotFound { account: String },

    #[error("{account} matched {count} directory entries")]
    Ambiguous { account: String, count: usize },

    #[error("ldap error: {0}")]
    Ldap(String),

    #[error("directory request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("unexpected value for {attribute}: {value}")]
    InvalidAttribute { attribute: String, value: String },

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl From<ldap3::LdapError> for DirectoryError {
    fn from(e: ldap3::LdapError) -> Self {
        DirectoryError::Ldap(e.to_string())
    }
}

/// Operations the lending library needs from the directory
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Set a service account's password
    async fn update_password(
        &self,
        conf: &DirectoryConfig,
        account: &str,
        password: &SecretString,
    ) -> Result<(), DirectoryError>;

    /// Set the password of the bind DN itself
    async fn update_root_password(
        &self,
        conf: &DirectoryConfig,
        bind_dn: &str,
        password: &SecretString,
    ) -> Result<(), DirectoryError>;

    async fn enable_account(&self, conf: &DirectoryConfig, account: &str) -> Result<(), DirectoryError>;

    async fn disable_account(&self, conf: &DirectoryConfig, account: &str) -> Result<(), DirectoryError>;

    /// When the account's password was last changed
    async fn password_last_set(
        &self,
        conf: &DirectoryConfig,
        account: &str,
    ) -> Result<DateTime<Utc>, DirectoryError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory directory with failure injection
    #[derive(Default)]
    pub struct FakeDirectoryClient {
        passwords: Mutex<HashMap<String, String>>,
        last_set: Mutex<HashMap<String, DateTime<Utc>>>,
        disabled: Mutex<HashSet<String>>,
        root_passwords: Mutex<Vec<String>>,
        fail_updates: AtomicBool,
        fail_root_updates: AtomicBool,
        updates: AtomicUsize,
    }

    impl FakeDirectoryClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every account password update fail until reset
        pub fn fail_updates(&self, fail: bool) {
            self.fail_updates.store(fail, Ordering::SeqCst);
        }

        pub fn fail_root_updates(&self, fail: bool) {
            self.fail_root_updates.store(fail, Ordering::SeqCst);
        }

        pub fn password(&self, account: &str) -> Option<String> {
            self.passwords.lock().unwrap().get(account).cloned()
        }

        /// Successful account password updates so far
        pub fn update_count(&self) -> usize {
            self.updates.load(Ordering::SeqCst)
        }

        /// Every root password set, oldest first
        pub fn root_passwords(&self) -> Vec<String> {
            self.root_passwords.lock().unwrap().clone()
        }

        pub fn is_disabled(&self, account: &str) -> bool {
            self.disabled.lock().unwrap().contains(account)
        }
    }

    #[async_trait]
    impl DirectoryClient for FakeDirectoryClient {
        async fn update_password(
            &self,
            _conf: &DirectoryConfig,
            account: &str,
            password: &SecretString,
        ) -> Result<(), DirectoryError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(DirectoryError::Unavailable("injected failure".to_string()));
            }
            self.passwords
                .lock()
                .unwrap()
                .insert(account.to_string(), password.expose_secret().to_string());
            self.last_set.lock().unwrap().insert(account.to_string(), Utc::now());
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update_root_password(
            &self,
            _conf: &DirectoryConfig,
            _bind_dn: &str,
            password: &SecretString,
        ) -> Result<(), DirectoryError> {
            if self.fail_root_updates.load(Ordering::SeqCst) {
                return Err(DirectoryError::Unavailable("injected failure".to_string()));
            }
            self.root_passwords
                .lock()
                .unwrap()
                .push(password.expose_secret().to_string());
            Ok(())
        }

        async fn enable_account(&self, _conf: &DirectoryConfig, account: &str) -> Result<(), DirectoryError> {
            self.disabled.lock().unwrap().remove(account);
            Ok(())
        }

        async fn disable_account(&self, _conf: &DirectoryConfig, account: &str) -> Result<(), DirectoryError> {
            self.disabled.lock().unwrap().insert(account.to_string());
            Ok(())
        }

        async fn password_last_set(
            &self,
            _conf: &DirectoryConfig,
            account: &str,
        ) -> Result<DateTime<Utc>, DirectoryError> {
            self.last_set
                .lock()
                .unwrap()
                .get(account)
                .copied()
                .ok_or_else(|| DirectoryError::AccountNotFound {
                    account: account.to_string(),
                })
        }
    }

    #[tokio::test]
    async fn test_fake_tracks_passwords_and_failures() {
        let conf = crate::test_support::engine_config().directory;
        let fake = FakeDirectoryClient::new();
        let pw = SecretString::from("hunter2hunter2".to_string());

        fake.update_password(&conf, "svc", &pw).await.unwrap();
        assert_eq!(fake.password("svc").as_deref(), Some("hunter2hunter2"));
        assert!(fake.password_last_set(&conf, "svc").await.is_ok());

        fake.fail_updates(true);
        assert!(fake.update_password(&conf, "svc", &pw).await.is_err());
        assert_eq!(fake.update_count(), 1);

        fake.disable_account(&conf, "svc").await.unwrap();
        assert!(fake.is_disabled("svc"));
        fake.enable_account(&conf, "svc").await.unwrap();
        assert!(!fake.is_disabled("svc"));
    }
}
