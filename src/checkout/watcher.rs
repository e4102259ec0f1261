//! Automatic check-in of overdue loans
//!
//! Every outstanding loan has one background task sleeping until its due
//! time. Renewals push a new due time through the task's `watch` channel;
//! check-in and delete cancel it. When the timer fires the task asks the
//! locker to reclaim the account, which re-reads the record under the
//! exclusive lock, so a timer racing a manual return checks in at most once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{chrono_duration, CheckOut, CheckOutHandler, ReclaimOutcome};
use crate::alerting::{AlertSeverity, Alerter};
use crate::storage::StorageHandle;
use crate::Result;

/// Longest single sleep; far-future dues are re-evaluated at this cadence
const MAX_SLEEP: Duration = Duration::from_secs(3600);

struct WatchSlot {
    generation: u64,
    due_tx: watch::Sender<DateTime<Utc>>,
    cancel: CancellationToken,
}

/// State shared between the watcher and its timer tasks
struct Shared {
    /// Storage handle from the most recent caller, used by timer tasks
    latest_storage: RwLock<StorageHandle>,
    slots: DashMap<String, WatchSlot>,
    next_generation: AtomicU64,
    retry_interval: Duration,
    alerter: Arc<dyn Alerter>,
    shutdown: CancellationToken,
}

impl Shared {
    fn latest_storage(&self) -> StorageHandle {
        self.latest_storage.read().unwrap().clone()
    }
}

/// Checks accounts back in when their loan runs out
pub struct OverdueWatcher {
    inner: Arc<dyn CheckOutHandler>,
    shared: Arc<Shared>,
}

impl OverdueWatcher {
    pub fn new(
        inner: Arc<dyn CheckOutHandler>,
        storage: StorageHandle,
        alerter: Arc<dyn Alerter>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared {
                latest_storage: RwLock::new(storage),
                slots: DashMap::new(),
                next_generation: AtomicU64::new(0),
                retry_interval,
                alerter,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Wait between attempts to check in an overdue account
    pub fn retry_interval(&self) -> Duration {
        self.shared.retry_interval
    }

    pub fn is_watching(&self, account: &str) -> bool {
        self.shared.slots.contains_key(account)
    }

    /// Accounts with a live timer
    pub fn watched_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.shared.slots.iter().map(|e| e.key().clone()).collect();
        accounts.sort();
        accounts
    }

    /// Arm a timer for the account, replacing any existing one
    pub fn start_watching(&self, account: &str, due: DateTime<Utc>) {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (due_tx, due_rx) = watch::channel(due);
        let cancel = self.shared.shutdown.child_token();

        let previous = self.shared.slots.insert(
            account.to_string(),
            WatchSlot {
                generation,
                due_tx,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        tracing::debug!(account = %account, due = %due, "watching loan");
        tokio::spawn(watch_loan(
            self.inner.clone(),
            self.shared.clone(),
            account.to_string(),
            generation,
            due_rx,
            cancel,
        ));
    }

    fn generation(&self, account: &str) -> Option<u64> {
        self.shared.slots.get(account).map(|slot| slot.generation)
    }

    /// Drop the timer that was live before the inner call. A check-out that
    /// landed since then owns a newer slot, which stays.
    fn stop_watching(&self, account: &str, generation: Option<u64>) {
        let Some(generation) = generation else {
            return;
        };
        if let Some((_, slot)) = self
            .shared
            .slots
            .remove_if(account, |_, slot| slot.generation == generation)
        {
            slot.cancel.cancel();
            tracing::debug!(account = %account, "stopped watching");
        }
    }

    /// Stop every timer task
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.slots.clear();
    }

    fn update_storage(&self, storage: &StorageHandle) {
        // Readers only on the common path
        if Arc::ptr_eq(&*self.shared.latest_storage.read().unwrap(), storage) {
            return;
        }
        *self.shared.latest_storage.write().unwrap() = storage.clone();
    }
}

async fn watch_loan(
    inner: Arc<dyn CheckOutHandler>,
    shared: Arc<Shared>,
    account: String,
    generation: u64,
    mut due_rx: watch::Receiver<DateTime<Utc>>,
    cancel: CancellationToken,
) {
    let mut due = *due_rx.borrow_and_update();

    loop {
        let wait = (due - Utc::now()).to_std().unwrap_or_default().min(MAX_SLEEP);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = due_rx.changed() => {
                // sender dropped: the slot is gone
                if changed.is_err() {
                    break;
                }
                due = *due_rx.borrow_and_update();
                tracing::debug!(account = %account, due = %due, "loan renewed");
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if Utc::now() < due {
            continue;
        }

        tracing::debug!(account = %account, due = %due, "loan is due, attempting check-in");
        let storage = shared.latest_storage();
        match inner.reclaim_if_overdue(&storage, &account).await {
            Ok(ReclaimOutcome::CheckedIn) => {
                tracing::info!(account = %account, due = %due, "checked in overdue account");
                break;
            }
            Ok(ReclaimOutcome::NotDue(next)) => {
                due = next;
            }
            Ok(ReclaimOutcome::NotOnLoan) => {
                tracing::debug!(account = %account, "account already returned");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    account = %account,
                    error = %e,
                    retry_secs = shared.retry_interval.as_secs(),
                    "couldn't check overdue account back in, will retry"
                );
                shared.alerter.alert(
                    &format!("Overdue account {account} could not be checked in: {e}"),
                    AlertSeverity::Error,
                );
                due = Utc::now() + chrono_duration(shared.retry_interval);
            }
        }
    }

    // A newer timer may own the slot by now
    shared
        .slots
        .remove_if(&account, |_, slot| slot.generation == generation);
}

#[async_trait]
impl CheckOutHandler for OverdueWatcher {
    async fn check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        self.update_storage(storage);
        self.inner.check_out(storage, account, checkout).await?;
        self.start_watching(account, checkout.due);
        Ok(())
    }

    async fn renew_check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        self.update_storage(storage);
        self.inner.renew_check_out(storage, account, checkout).await?;

        let rearm = match self.shared.slots.get(account) {
            Some(slot) => {
                slot.due_tx.send_replace(checkout.due);
                false
            }
            None => true,
        };
        if rearm {
            // the timer died (restart, shutdown race), start a new one
            self.start_watching(account, checkout.due);
        }
        Ok(())
    }

    async fn check_in(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        self.update_storage(storage);
        let generation = self.generation(account);
        self.inner.check_in(storage, account).await?;
        self.stop_watching(account, generation);
        Ok(())
    }

    async fn status(&self, storage: &StorageHandle, account: &str) -> Result<CheckOut> {
        self.update_storage(storage);
        self.inner.status(storage, account).await
    }

    async fn delete(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        self.update_storage(storage);
        let generation = self.generation(account);
        self.inner.delete(storage, account).await?;
        self.stop_watching(account, generation);
        Ok(())
    }

    async fn reclaim_if_overdue(&self, storage: &StorageHandle, account: &str) -> Result<ReclaimOutcome> {
        self.update_storage(storage);
        let generation = self.generation(account);
        let outcome = self.inner.reclaim_if_overdue(storage, account).await?;
        if outcome == ReclaimOutcome::CheckedIn {
            self.stop_watching(account, generation);
        }
        Ok(outcome)
    }
}
