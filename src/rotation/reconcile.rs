//! Recovery log sweep
//!
//! Each pass walks the pending password rotations and retries them under
//! the account's exclusive lock. Static role rotations are retried by the
//! role manager under the role's lock. Entries that still fail stay for the
//! next pass.

use std::sync::Arc;

use crate::alerting::{AlertSeverity, Alerter};
use crate::checkout::{KeyedLocks, PasswordHandler, RetryOutcome};
use crate::roles::RoleManager;
use crate::storage::StorageHandle;
use crate::wal::{self, RotatePassword, ROTATE_PASSWORD_KIND, ROTATE_ROLE_KIND};
use crate::Result;

/// What one sweep did, by recovery entry id
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: Vec<String>,
    pub discarded: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Reconciler {
    passwords: Arc<PasswordHandler>,
    locks: Arc<KeyedLocks>,
    alerter: Arc<dyn Alerter>,
    roles: Option<Arc<RoleManager>>,
}

impl Reconciler {
    /// `locks` must be the table the checkout chain's locker uses
    pub fn new(passwords: Arc<PasswordHandler>, locks: Arc<KeyedLocks>, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            passwords,
            locks,
            alerter,
            roles: None,
        }
    }

    /// Also retry pending static role rotations
    pub fn with_roles(mut self, roles: Arc<RoleManager>) -> Self {
        self.roles = Some(roles);
        self
    }

    fn record(report: &mut ReconcileReport, id: String, outcome: Result<RetryOutcome>, subject: &str) {
        match outcome {
            Ok(RetryOutcome::Applied) => report.applied.push(id),
            Ok(RetryOutcome::Discarded) => report.discarded.push(id),
            // superseded while we waited for the lock
            Ok(RetryOutcome::Skipped) => {}
            Err(e) => {
                tracing::warn!(id = %id, subject = %subject, error = %e, "rotation still failing");
                report.failed.push(id);
            }
        }
    }

    pub async fn run_once(&self, storage: &StorageHandle) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for id in wal::list_entries(storage.as_ref()).await? {
            let Some(entry) = wal::get_entry(storage.as_ref(), &id).await? else {
                continue;
            };
            if entry.kind == ROTATE_ROLE_KIND {
                if let Some(roles) = &self.roles {
                    let outcome = roles.retry_rotation(&id).await;
                    Self::record(&mut report, id, outcome, "static role");
                }
                continue;
            }
            if entry.kind != ROTATE_PASSWORD_KIND {
                continue;
            }
            let account = match entry.decode::<RotatePassword>() {
                Ok(pending) => pending.service_account_name,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "undecodable recovery entry");
                    report.failed.push(id);
                    continue;
                }
            };

            let _guard = self.locks.write(&account).await;
            let outcome = self.passwords.retry_rotation(storage, &id).await;
            Self::record(&mut report, id, outcome, &account);
        }

        if report.is_clean() {
            if !report.applied.is_empty() || !report.discarded.is_empty() {
                tracing::info!(
                    applied = report.applied.len(),
                    discarded = report.discarded.len(),
                    "recovery sweep finished"
                );
            }
        } else {
            self.alerter.alert(
                &format!(
                    "{} password rotation(s) still pending after recovery sweep",
                    report.failed.len()
                ),
                AlertSeverity::Warning,
            );
        }

        Ok(report)
    }
}
