//! Library sets and the set-level lending operations
//!
//! A set is a named group of accounts sharing a lending policy. Sets are
//! the public surface: callers check out "any account from set X", check
//! in what they borrowed and read the set's status. Each account belongs
//! to at most one set, enforced when accounts are added.
//!
//! The library serializes its own work with two lock tables: one per set
//! name for set writes and one per account for multi-step account work. They
//! are separate from the locks inside the checkout chain, which every
//! handler call takes again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::checkout::{retrieve_password, CheckOut, CheckOutHandler, KeyedLocks};
use crate::storage::{self, Storage, StorageHandle, LIBRARY_PREFIX};
use crate::{LibraryError, Result};

/// Default check-out length and renewal ceiling
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Stored at `library/<name>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibrarySet {
    pub service_account_names: Vec<String>,
    /// Check-out length in seconds, 0 = unlimited
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// Longest renewal in seconds, 0 = unlimited
    #[serde(default = "default_ttl")]
    pub max_ttl: u64,
    #[serde(default)]
    pub disable_check_in_enforcement: bool,
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

impl Default for LibrarySet {
    fn default() -> Self {
        Self {
            service_account_names: Vec::new(),
            ttl: DEFAULT_TTL_SECS,
            max_ttl: DEFAULT_TTL_SECS,
            disable_check_in_enforcement: false,
        }
    }
}

impl LibrarySet {
    pub fn validate(&self) -> Result<()> {
        if self.service_account_names.is_empty() {
            return Err(LibraryError::Validation(
                "at least one service account must be configured".to_string(),
            ));
        }
        if self.max_ttl > 0 && self.ttl > 0 && self.max_ttl < self.ttl {
            return Err(LibraryError::Validation(format!(
                "max_ttl ({} seconds) may not be less than ttl ({} seconds)",
                self.max_ttl, self.ttl
            )));
        }
        let unique: BTreeSet<&String> = self.service_account_names.iter().collect();
        if unique.len() != self.service_account_names.len() {
            return Err(LibraryError::Validation(
                "service account names must be unique".to_string(),
            ));
        }
        Ok(())
    }

    fn contains(&self, account: &str) -> bool {
        self.service_account_names.iter().any(|a| a == account)
    }
}

/// Fields of a set write. `None` keeps the current value on update and
/// takes the default on create.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetParams {
    #[serde(default)]
    pub service_account_names: Option<Vec<String>>,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub max_ttl: Option<u64>,
    #[serde(default)]
    pub disable_check_in_enforcement: Option<bool>,
}

/// Who is asking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Borrower {
    pub entity_id: String,
    pub client_token: String,
}

impl Borrower {
    pub fn new(entity_id: impl Into<String>, client_token: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            client_token: client_token.into(),
        }
    }

    /// Matches the loan's borrower by entity or by token
    pub fn holds(&self, checkout: &CheckOut) -> bool {
        let same_entity = !checkout.borrower_entity_id.is_empty()
            && !self.entity_id.is_empty()
            && checkout.borrower_entity_id == self.entity_id;
        let same_token = !checkout.borrower_client_token.is_empty()
            && !self.client_token.is_empty()
            && checkout.borrower_client_token == self.client_token;
        same_entity || same_token
    }
}

/// Credentials handed to a borrower
#[derive(Debug, Clone)]
pub struct Lease {
    pub service_account_name: String,
    pub password: SecretString,
    /// Seconds, 0 = unlimited
    pub ttl: u64,
    pub max_ttl: u64,
    pub renewable: bool,
    pub due: DateTime<Utc>,
}

/// Outcome of a set check-out
#[derive(Debug, Clone)]
pub enum CheckOutResult {
    Lent(Lease),
    /// Every account is on loan. A capacity condition, not a fault.
    Unavailable,
}

/// Outcome of a set check-in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckInOutcome {
    pub checked_in: Vec<String>,
    /// Named accounts the caller didn't borrow
    pub denied: Vec<String>,
}

/// One account in a set status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borrower_entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borrower_client_token: Option<String>,
}

impl From<&CheckOut> for AccountStatus {
    fn from(checkout: &CheckOut) -> Self {
        if checkout.is_available {
            return Self {
                available: true,
                due: None,
                borrower_entity_id: None,
                borrower_client_token: None,
            };
        }
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            available: false,
            due: Some(checkout.due),
            borrower_entity_id: non_empty(&checkout.borrower_entity_id),
            borrower_client_token: non_empty(&checkout.borrower_client_token),
        }
    }
}

/// Lowercase and check a set name
pub fn normalize_set_name(name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');

    if name.is_empty()
        || !name.chars().all(valid_char)
        || !edge_ok(name.chars().next())
        || !edge_ok(name.chars().last())
    {
        return Err(LibraryError::Validation(format!("invalid set name {name:?}")));
    }
    Ok(name)
}

/// Pick the loan length for a check-out
fn negotiate_ttl(set_ttl: u64, requested: Option<u64>) -> u64 {
    match requested {
        Some(r) if set_ttl == 0 && r > 0 => r,
        Some(r) if set_ttl > 0 && r > 0 && r < set_ttl => r,
        _ => set_ttl,
    }
}

fn lending_period(secs: u64) -> Option<std::time::Duration> {
    (secs > 0).then(|| std::time::Duration::from_secs(secs))
}

fn set_key(name: &str) -> String {
    format!("{LIBRARY_PREFIX}{name}")
}

/// The lending library
pub struct Library {
    storage: StorageHandle,
    handler: Arc<dyn CheckOutHandler>,
    set_locks: KeyedLocks,
    account_locks: KeyedLocks,
}

impl Library {
    pub fn new(storage: StorageHandle, handler: Arc<dyn CheckOutHandler>) -> Self {
        Self {
            storage,
            handler,
            set_locks: KeyedLocks::new(),
            account_locks: KeyedLocks::new(),
        }
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    async fn load_set(&self, name: &str) -> Result<Option<LibrarySet>> {
        Ok(storage::get_json(self.storage.as_ref(), &set_key(name)).await?)
    }

    async fn require_set(&self, name: &str) -> Result<LibrarySet> {
        self.load_set(name).await?.ok_or_else(|| LibraryError::SetNotFound {
            name: name.to_string(),
        })
    }

    async fn store_set(&self, name: &str, set: &LibrarySet) -> Result<()> {
        storage::put_json(self.storage.as_ref(), &set_key(name), set).await?;
        Ok(())
    }

    pub async fn set_exists(&self, name: &str) -> Result<bool> {
        let name = normalize_set_name(name)?;
        Ok(self.load_set(&name).await?.is_some())
    }

    /// Start tracking an account. Fails (as a user error) if another set
    /// already manages it.
    async fn check_in_new_account(&self, account: &str) -> Result<()> {
        // held across the check and the claim so two sets can't both take it
        let _guard = self.account_locks.write(account).await;
        match self.handler.status(&self.storage, account).await {
            Ok(_) => Err(LibraryError::Validation(format!(
                "{account} is already managed by another set, please remove it and try again"
            ))),
            Err(LibraryError::NotFound { .. }) => self.handler.check_in(&self.storage, account).await,
            Err(e) => Err(e),
        }
    }

    /// Stop tracking an account. Fails (as a user error) while it is lent.
    async fn remove_account(&self, account: &str) -> Result<()> {
        match self.handler.status(&self.storage, account).await {
            Ok(checkout) if !checkout.is_available => Err(LibraryError::Validation(format!(
                "{account:?} can't be deleted because it is currently checked out"
            ))),
            Ok(_) => self.handler.delete(&self.storage, account).await,
            Err(LibraryError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn create_set(&self, name: &str, params: SetParams) -> Result<()> {
        let name = normalize_set_name(name)?;
        let _guard = self.set_locks.write(&name).await;

        if self.load_set(&name).await?.is_some() {
            return Err(LibraryError::Validation(format!("set {name:?} already exists")));
        }

        let requested = params.service_account_names.unwrap_or_default();
        if requested.is_empty() {
            return Err(LibraryError::Validation(
                "\"service_account_names\" must be provided".to_string(),
            ));
        }

        let mut user_errors = Vec::new();
        let mut accepted = Vec::new();
        for account in requested {
            match self.check_in_new_account(&account).await {
                Ok(()) => accepted.push(account),
                Err(LibraryError::Validation(msg)) => user_errors.push(msg),
                Err(e) => return Err(e),
            }
        }

        let set = LibrarySet {
            service_account_names: accepted,
            ttl: params.ttl.unwrap_or(DEFAULT_TTL_SECS),
            max_ttl: params.max_ttl.unwrap_or(DEFAULT_TTL_SECS),
            disable_check_in_enforcement: params.disable_check_in_enforcement.unwrap_or(false),
        };
        set.validate()?;
        self.store_set(&name, &set).await?;
        tracing::info!(set = %name, accounts = set.service_account_names.len(), "created set");

        if !user_errors.is_empty() {
            return Err(LibraryError::PartiallyApplied { errors: user_errors });
        }
        Ok(())
    }

    pub async fn update_set(&self, name: &str, params: SetParams) -> Result<()> {
        let name = normalize_set_name(name)?;
        let _guard = self.set_locks.write(&name).await;

        let mut set = self.require_set(&name).await?;
        let mut user_errors = Vec::new();

        if let Some(mut names) = params.service_account_names {
            let added: Vec<String> = names.iter().filter(|n| !set.contains(n)).cloned().collect();
            for account in added {
                match self.check_in_new_account(&account).await {
                    Ok(()) => {}
                    Err(LibraryError::Validation(msg)) => {
                        names.retain(|n| n != &account);
                        user_errors.push(msg);
                    }
                    Err(e) => return Err(e),
                }
            }

            let removed: Vec<String> = set
                .service_account_names
                .iter()
                .filter(|n| !names.contains(n))
                .cloned()
                .collect();
            for account in removed {
                match self.remove_account(&account).await {
                    Ok(()) => {}
                    Err(LibraryError::Validation(msg)) => {
                        names.push(account);
                        user_errors.push(msg);
                    }
                    Err(e) => return Err(e),
                }
            }

            set.service_account_names = names;
        }
        if let Some(ttl) = params.ttl {
            set.ttl = ttl;
        }
        if let Some(max_ttl) = params.max_ttl {
            set.max_ttl = max_ttl;
        }
        if let Some(disable) = params.disable_check_in_enforcement {
            set.disable_check_in_enforcement = disable;
        }

        set.validate()?;
        self.store_set(&name, &set).await?;
        tracing::info!(set = %name, accounts = set.service_account_names.len(), "updated set");

        if !user_errors.is_empty() {
            return Err(LibraryError::PartiallyApplied { errors: user_errors });
        }
        Ok(())
    }

    pub async fn read_set(&self, name: &str) -> Result<LibrarySet> {
        let name = normalize_set_name(name)?;
        let _guard = self.set_locks.read(&name).await;
        self.require_set(&name).await
    }

    /// Delete a set and forget its accounts. Refused while any is lent.
    pub async fn delete_set(&self, name: &str) -> Result<()> {
        let name = normalize_set_name(name)?;
        let _guard = self.set_locks.write(&name).await;

        let Some(set) = self.load_set(&name).await? else {
            return Ok(());
        };

        // all or nothing: a kept set must not list forgotten accounts
        let mut lent = Vec::new();
        for account in &set.service_account_names {
            match self.handler.status(&self.storage, account).await {
                Ok(checkout) if !checkout.is_available => lent.push(format!(
                    "{account:?} can't be deleted because it is currently checked out"
                )),
                Ok(_) | Err(LibraryError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if !lent.is_empty() {
            return Err(LibraryError::Validation(lent.join("; ")));
        }

        for account in &set.service_account_names {
            self.remove_account(account).await?;
        }
        self.storage.delete(&set_key(&name)).await?;
        tracing::info!(set = %name, "deleted set");
        Ok(())
    }

    pub async fn list_sets(&self) -> Result<Vec<String>> {
        Ok(self.storage.list(LIBRARY_PREFIX).await?)
    }

    /// Lend the first available account in the set
    pub async fn check_out(
        &self,
        set_name: &str,
        requested_ttl: Option<u64>,
        borrower: &Borrower,
    ) -> Result<CheckOutResult> {
        let set_name = normalize_set_name(set_name)?;
        let set = self.require_set(&set_name).await?;
        let mut ttl = negotiate_ttl(set.ttl, requested_ttl);
        if set.max_ttl > 0 && (ttl == 0 || ttl > set.max_ttl) {
            ttl = set.max_ttl;
        }

        for account in &set.service_account_names {
            let _guard = self.account_locks.write(account).await;

            let loan = CheckOut::lend(&borrower.entity_id, &borrower.client_token, lending_period(ttl));
            match self.handler.check_out(&self.storage, account, &loan).await {
                Ok(()) => {}
                Err(LibraryError::AlreadyCheckedOut { .. }) => continue,
                Err(e) => return Err(e),
            }

            let password = retrieve_password(&self.storage, account).await?;
            tracing::info!(set = %set_name, account = %account, ttl = ttl, "checked out");
            return Ok(CheckOutResult::Lent(Lease {
                service_account_name: account.clone(),
                password,
                ttl,
                max_ttl: set.max_ttl,
                renewable: true,
                due: loan.due,
            }));
        }

        tracing::debug!(set = %set_name, "no accounts available");
        Ok(CheckOutResult::Unavailable)
    }

    /// Return accounts to the set.
    ///
    /// With no names, the one account the caller may return is checked in;
    /// if several qualify the caller must name them. `force` skips borrower
    /// enforcement.
    pub async fn check_in(
        &self,
        set_name: &str,
        accounts: &[String],
        borrower: &Borrower,
        force: bool,
    ) -> Result<CheckInOutcome> {
        let set_name = normalize_set_name(set_name)?;
        let set = self.require_set(&set_name).await?;
        let enforce = !(force || set.disable_check_in_enforcement);
        let mut outcome = CheckInOutcome::default();

        if accounts.is_empty() {
            let mut eligible = Vec::new();
            for account in &set.service_account_names {
                let guard = self.account_locks.write(account).await;
                let checkout = match self.handler.status(&self.storage, account).await {
                    Ok(checkout) => checkout,
                    // listed but never tracked, e.g. after a failed add
                    Err(LibraryError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                };
                if checkout.is_available || (enforce && !borrower.holds(&checkout)) {
                    continue;
                }
                // keep the lock until the check-in below
                eligible.push((account.clone(), guard));
            }

            match eligible.len() {
                0 => {}
                1 => {
                    let (account, _guard) = eligible.remove(0);
                    self.handler.check_in(&self.storage, &account).await?;
                    outcome.checked_in.push(account);
                }
                _ => {
                    return Err(LibraryError::Validation(
                        "when multiple service accounts are checked out, the \"service_account_names\" to check in must be provided"
                            .to_string(),
                    ))
                }
            }
        } else {
            if let Some(stranger) = accounts.iter().find(|a| !set.contains(a)) {
                return Err(LibraryError::Validation(format!(
                    "{stranger} is not a member of set {set_name:?}"
                )));
            }

            for account in accounts {
                let _guard = self.account_locks.write(account).await;
                let checkout = self.handler.status(&self.storage, account).await?;
                if checkout.is_available {
                    continue;
                }
                if enforce && !borrower.holds(&checkout) {
                    outcome.denied.push(account.clone());
                    continue;
                }
                self.handler.check_in(&self.storage, account).await?;
                outcome.checked_in.push(account.clone());
            }
        }

        if !outcome.checked_in.is_empty() {
            tracing::info!(set = %set_name, accounts = ?outcome.checked_in, forced = force, "checked in");
        }
        Ok(outcome)
    }

    /// Loan state of every account in the set
    pub async fn set_status(&self, set_name: &str) -> Result<BTreeMap<String, AccountStatus>> {
        let set_name = normalize_set_name(set_name)?;
        let set = self.require_set(&set_name).await?;

        let mut report = BTreeMap::new();
        for account in &set.service_account_names {
            let checkout = self.handler.status(&self.storage, account).await?;
            report.insert(account.clone(), AccountStatus::from(&checkout));
        }
        Ok(report)
    }

    /// Extend a loan by `increment` seconds (default: the set TTL). The
    /// loan's whole lifetime, measured from check-out, is capped at the
    /// set's max TTL. Returns the new due time.
    pub async fn renew(
        &self,
        set_name: &str,
        account: &str,
        increment: Option<u64>,
        borrower: &Borrower,
    ) -> Result<DateTime<Utc>> {
        let set_name = normalize_set_name(set_name)?;
        let set = self.require_set(&set_name).await?;
        self.require_member(&set, &set_name, account)?;

        let _guard = self.account_locks.write(account).await;
        let current = self.handler.status(&self.storage, account).await?;
        if current.is_available {
            return Err(LibraryError::NotCurrentlyCheckedOut {
                account: account.to_string(),
            });
        }
        if !set.disable_check_in_enforcement && !borrower.holds(&current) {
            return Err(LibraryError::NotBorrower {
                account: account.to_string(),
            });
        }

        let secs = increment.filter(|i| *i > 0).unwrap_or(set.ttl);
        let fresh = current.renewed(lending_period(secs), lending_period(set.max_ttl));
        if fresh.due <= Utc::now() {
            return Err(LibraryError::Validation(format!(
                "loan of {account} has reached its max_ttl of {} seconds",
                set.max_ttl
            )));
        }
        self.handler.renew_check_out(&self.storage, account, &fresh).await?;
        tracing::info!(set = %set_name, account = %account, due = %fresh.due, "renewed");
        Ok(fresh.due)
    }

    /// End a loan early. Returning an available account succeeds.
    pub async fn return_account(&self, set_name: &str, account: &str, borrower: &Borrower) -> Result<()> {
        let set_name = normalize_set_name(set_name)?;
        let set = self.require_set(&set_name).await?;
        self.require_member(&set, &set_name, account)?;

        let _guard = self.account_locks.write(account).await;
        let current = self.handler.status(&self.storage, account).await?;
        if current.is_available {
            return Ok(());
        }
        if !set.disable_check_in_enforcement && !borrower.holds(&current) {
            return Err(LibraryError::NotBorrower {
                account: account.to_string(),
            });
        }
        self.handler.check_in(&self.storage, account).await?;
        tracing::info!(set = %set_name, account = %account, "returned");
        Ok(())
    }

    fn require_member(&self, set: &LibrarySet, set_name: &str, account: &str) -> Result<()> {
        if set.contains(account) {
            Ok(())
        } else {
            Err(LibraryError::Validation(format!(
                "{account} is not a member of set {set_name:?}"
            )))
        }
    }
}
