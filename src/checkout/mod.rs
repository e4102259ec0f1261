//! Checkout core
//!
//! Calls flow through a fixed chain of handlers, each doing one job before
//! delegating inward:
//!
//! ```text
//! leader:   InputValidator -> OverdueWatcher -> ServiceAccountLocker -> PasswordHandler -> StorageHandler
//! follower: InputValidator -> ServiceAccountLocker -> StorageHandler
//! ```
//!
//! Followers only serve status reads, so they need neither password rotation
//! nor overdue timers. Watcher timers re-enter the chain at the locker, below
//! the validator.

mod locker;
mod password;
mod storage;
mod validator;
mod watcher;

pub use locker::{KeyedLocks, ServiceAccountLocker};
pub use password::{retrieve_password, PasswordHandler, RetryOutcome};
pub use storage::StorageHandler;
pub use validator::{validate_account_name, InputValidator};
pub use watcher::OverdueWatcher;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerting::Alerter;
use crate::config::Role;
use crate::directory::DirectoryClient;
use crate::library::LibrarySet;
use crate::storage::{self as store, Storage, StorageHandle, LIBRARY_PREFIX};
use crate::{LibraryError, Result};

/// Loans without an expiry are due this far in the future
pub const UNLIMITED_LENDING_DAYS: i64 = 365 * 100;

/// Loan state of one account, stored at `checkout/<account>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckOut {
    pub is_available: bool,
    #[serde(default)]
    pub borrower_entity_id: String,
    #[serde(default)]
    pub borrower_client_token: String,
    /// Loan length in seconds, informational
    #[serde(default)]
    pub lending_period: u64,
    pub due: DateTime<Utc>,
    /// When the loan began; renewals never push `due` past this plus the set's max TTL
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl CheckOut {
    /// Record for an account nobody holds
    pub fn available() -> Self {
        Self {
            is_available: true,
            borrower_entity_id: String::new(),
            borrower_client_token: String::new(),
            lending_period: 0,
            due: Utc::now(),
            issued_at: Utc::now(),
        }
    }

    /// A loan starting now. `None` lends without expiry.
    pub fn lend(
        borrower_entity_id: impl Into<String>,
        borrower_client_token: impl Into<String>,
        lending_period: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        let (secs, due) = match lending_period {
            Some(period) => (period.as_secs(), now + chrono_duration(period)),
            None => (0, now + chrono::Duration::days(UNLIMITED_LENDING_DAYS)),
        };
        Self {
            is_available: false,
            borrower_entity_id: borrower_entity_id.into(),
            borrower_client_token: borrower_client_token.into(),
            lending_period: secs,
            due,
            issued_at: now,
        }
    }

    /// The same loan extended to now + `extension` (`None` = no expiry), but
    /// never beyond `issued_at + max_lifetime`
    pub fn renewed(&self, extension: Option<Duration>, max_lifetime: Option<Duration>) -> Self {
        let now = Utc::now();
        let mut due = match extension {
            Some(extension) => now + chrono_duration(extension),
            None => now + chrono::Duration::days(UNLIMITED_LENDING_DAYS),
        };
        if let Some(max_lifetime) = max_lifetime {
            due = due.min(self.issued_at + chrono_duration(max_lifetime));
        }
        Self {
            lending_period: extension.map_or(0, |e| e.as_secs()),
            due,
            ..self.clone()
        }
    }

    /// On loan and past due
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_available && self.due <= now
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(UNLIMITED_LENDING_DAYS))
}

/// Result of asking the chain to reclaim an account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The loan was overdue and the account is now checked in
    CheckedIn,
    /// Still on loan, due at the given time
    NotDue(DateTime<Utc>),
    /// Available or untracked, nothing to do
    NotOnLoan,
}

/// One layer of the checkout chain
#[async_trait]
pub trait CheckOutHandler: Send + Sync {
    /// Lend an account. Fails with `AlreadyCheckedOut` if it is on loan.
    async fn check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()>;

    /// Replace the due time and borrower of a current loan.
    /// Fails with `NotCurrentlyCheckedOut` if the account is available.
    async fn renew_check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()>;

    /// Return an account. On error the account stays checked out.
    async fn check_in(&self, storage: &StorageHandle, account: &str) -> Result<()>;

    /// Current record, `NotFound` if the account was never checked in
    async fn status(&self, storage: &StorageHandle, account: &str) -> Result<CheckOut>;

    /// Forget everything tracked for the account
    async fn delete(&self, storage: &StorageHandle, account: &str) -> Result<()>;

    /// Check the account in only if it is still on loan past its due time
    async fn reclaim_if_overdue(&self, storage: &StorageHandle, account: &str) -> Result<ReclaimOutcome> {
        let checkout = match self.status(storage, account).await {
            Ok(checkout) => checkout,
            Err(LibraryError::NotFound { .. }) => return Ok(ReclaimOutcome::NotOnLoan),
            Err(e) => return Err(e),
        };

        if checkout.is_available {
            return Ok(ReclaimOutcome::NotOnLoan);
        }
        if !checkout.is_overdue(Utc::now()) {
            return Ok(ReclaimOutcome::NotDue(checkout.due));
        }

        self.check_in(storage, account).await?;
        Ok(ReclaimOutcome::CheckedIn)
    }
}

/// Tunables for the handler chain
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Wait before retrying a failed overdue check-in
    pub overdue_retry: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            overdue_retry: Duration::from_secs(60),
        }
    }
}

/// The assembled chain plus handles on the layers other subsystems need
pub struct HandlerStack {
    pub handler: Arc<dyn CheckOutHandler>,
    /// Present on leaders
    pub watcher: Option<Arc<OverdueWatcher>>,
    /// Present on leaders, used by the reconciliation sweep
    pub passwords: Option<Arc<PasswordHandler>>,
    /// Account locks shared with the reconciliation sweep
    pub locks: Arc<KeyedLocks>,
}

/// What the start-up scan did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Overdue loans checked in immediately
    pub reclaimed: Vec<String>,
    /// Loans with a watcher armed
    pub watching: Vec<String>,
    /// Overdue loans whose check-in failed, retried by their watcher
    pub deferred: Vec<String>,
}

impl HandlerStack {
    /// Build the chain for this node's role. Leaders also restore watchers
    /// for every outstanding loan.
    pub async fn build(
        role: Role,
        storage: StorageHandle,
        client: Arc<dyn DirectoryClient>,
        alerter: Arc<dyn Alerter>,
        settings: HandlerSettings,
    ) -> Result<Self> {
        let locks = Arc::new(KeyedLocks::new());
        let storage_handler: Arc<dyn CheckOutHandler> = Arc::new(StorageHandler::new());

        if role == Role::Follower {
            let locker = Arc::new(ServiceAccountLocker::new(storage_handler, locks.clone()));
            tracing::info!("checkout handlers ready (follower)");
            return Ok(Self {
                handler: Arc::new(InputValidator::new(locker)),
                watcher: None,
                passwords: None,
                locks,
            });
        }

        let passwords = Arc::new(PasswordHandler::new(storage_handler, client));
        let locker = Arc::new(ServiceAccountLocker::new(passwords.clone(), locks.clone()));
        let watcher = Arc::new(OverdueWatcher::new(
            locker,
            storage.clone(),
            alerter,
            settings.overdue_retry,
        ));

        let report = bootstrap(&storage, &watcher).await?;
        tracing::info!(
            reclaimed = report.reclaimed.len(),
            watching = report.watching.len(),
            deferred = report.deferred.len(),
            "checkout handlers ready (leader)"
        );

        Ok(Self {
            handler: Arc::new(InputValidator::new(watcher.clone())),
            watcher: Some(watcher),
            passwords: Some(passwords),
            locks,
        })
    }

    /// Stop every watcher task
    pub fn shutdown(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.shutdown();
        }
    }
}

/// Restore overdue handling after a restart: check in loans that came due
/// while we were down and watch the rest.
pub async fn bootstrap(storage: &StorageHandle, watcher: &Arc<OverdueWatcher>) -> Result<BootstrapReport> {
    let mut report = BootstrapReport::default();

    for set_name in storage.list(LIBRARY_PREFIX).await? {
        let key = format!("{LIBRARY_PREFIX}{set_name}");
        let Some(set) = store::get_json::<LibrarySet>(storage.as_ref(), &key).await? else {
            continue;
        };

        for account in &set.service_account_names {
            let checkout = match watcher.status(storage, account).await {
                Ok(checkout) => checkout,
                Err(LibraryError::NotFound { .. }) => {
                    tracing::debug!(set = %set_name, account = %account, "account not tracked yet");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if checkout.is_available {
                continue;
            }

            if !checkout.is_overdue(Utc::now()) {
                watcher.start_watching(account, checkout.due);
                report.watching.push(account.clone());
                continue;
            }

            match watcher.check_in(storage, account).await {
                Ok(()) => {
                    tracing::info!(account = %account, due = %checkout.due, "reclaimed overdue account on start-up");
                    report.reclaimed.push(account.clone());
                }
                Err(e) => {
                    tracing::warn!(account = %account, error = %e, "start-up check-in failed, will retry");
                    watcher.start_watching(account, Utc::now() + chrono_duration(watcher.retry_interval()));
                    report.deferred.push(account.clone());
                }
            }
        }
    }

    Ok(report)
}
