//! Per-account mutual exclusion
//!
//! Mutations take the account's lock exclusively and hold it across every
//! storage and directory round trip below. Status reads share it. Accounts
//! never wait on each other.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::{CheckOut, CheckOutHandler, ReclaimOutcome};
use crate::storage::StorageHandle;
use crate::Result;

/// Lazily created read/write locks keyed by name.
///
/// Entries are never removed: the key space is the set of managed accounts,
/// which operators bound.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `key`, created on first use
    pub fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        if let Some(lock) = self.locks.get(key) {
            return lock.value().clone();
        }
        self.locks.entry(key.to_string()).or_default().value().clone()
    }

    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(key).write_owned().await
    }

    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(key).read_owned().await
    }

    /// Number of keys that have ever been locked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Serializes calls per account before delegating inward
pub struct ServiceAccountLocker {
    inner: Arc<dyn CheckOutHandler>,
    locks: Arc<KeyedLocks>,
}

impl ServiceAccountLocker {
    pub fn new(inner: Arc<dyn CheckOutHandler>, locks: Arc<KeyedLocks>) -> Self {
        Self { inner, locks }
    }
}

#[async_trait]
impl CheckOutHandler for ServiceAccountLocker {
    async fn check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        let _guard = self.locks.write(account).await;
        self.inner.check_out(storage, account, checkout).await
    }

    async fn renew_check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        let _guard = self.locks.write(account).await;
        self.inner.renew_check_out(storage, account, checkout).await
    }

    async fn check_in(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        let _guard = self.locks.write(account).await;
        self.inner.check_in(storage, account).await
    }

    async fn status(&self, storage: &StorageHandle, account: &str) -> Result<CheckOut> {
        let _guard = self.locks.read(account).await;
        self.inner.status(storage, account).await
    }

    async fn delete(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        let _guard = self.locks.write(account).await;
        self.inner.delete(storage, account).await
    }

    // Status check and check-in under one exclusive hold, so a timer that
    // fires as a manual check-in lands sees the returned account and stops.
    async fn reclaim_if_overdue(&self, storage: &StorageHandle, account: &str) -> Result<ReclaimOutcome> {
        let _guard = self.locks.write(account).await;
        self.inner.reclaim_if_overdue(storage, account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::StorageHandler;
    use crate::storage::MemoryStorage;
    use crate::test_support::{loan, ACCOUNT};
    use crate::LibraryError;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Writes a record in two halves with a yield in between, so an
    /// unserialized reader would see a half-written loan.
    #[derive(Default)]
    struct TwoStepHandler {
        record: Mutex<Option<CheckOut>>,
    }

    impl TwoStepHandler {
        async fn write(&self, checkout: CheckOut) {
            {
                let mut record = self.record.lock().unwrap();
                let current = record.get_or_insert_with(CheckOut::available);
                current.is_available = checkout.is_available;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            let mut record = self.record.lock().unwrap();
            *record = Some(checkout);
        }
    }

    #[async_trait]
    impl CheckOutHandler for TwoStepHandler {
        async fn check_out(&self, _: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
            let on_loan = matches!(&*self.record.lock().unwrap(), Some(c) if !c.is_available);
            if on_loan {
                return Err(LibraryError::AlreadyCheckedOut {
                    account: account.to_string(),
                });
            }
            self.write(checkout.clone()).await;
            Ok(())
        }

        async fn renew_check_out(&self, _: &StorageHandle, _: &str, checkout: &CheckOut) -> Result<()> {
            self.write(checkout.clone()).await;
            Ok(())
        }

        async fn check_in(&self, _: &StorageHandle, _: &str) -> Result<()> {
            self.write(CheckOut::available()).await;
            Ok(())
        }

        async fn status(&self, _: &StorageHandle, account: &str) -> Result<CheckOut> {
            self.record
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| LibraryError::NotFound {
                    account: account.to_string(),
                })
        }

        async fn delete(&self, _: &StorageHandle, _: &str) -> Result<()> {
            *self.record.lock().unwrap() = None;
            Ok(())
        }
    }

    #[test]
    fn test_lock_created_once_per_key() {
        let locks = KeyedLocks::new();
        let a = locks.lock_for("a");
        let again = locks.lock_for("a");
        let b = locks.lock_for("b");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lock_creation_is_race_free() {
        let locks = Arc::new(KeyedLocks::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move { locks.lock_for("shared") }));
        }
        let mut created = Vec::new();
        for handle in handles {
            created.push(handle.await.unwrap());
        }
        assert!(created.iter().all(|l| Arc::ptr_eq(l, &created[0])));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_torn_reads_under_contention() {
        let storage: StorageHandle = Arc::new(MemoryStorage::new());
        let locker = Arc::new(ServiceAccountLocker::new(
            Arc::new(TwoStepHandler::default()),
            Arc::new(KeyedLocks::new()),
        ));
        locker.check_in(&storage, ACCOUNT).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..64 {
            let locker = locker.clone();
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                match i % 4 {
                    0 => {
                        let _ = locker
                            .check_out(&storage, ACCOUNT, &loan(Utc::now() + chrono::Duration::hours(1)))
                            .await;
                    }
                    1 => locker.check_in(&storage, ACCOUNT).await.unwrap(),
                    2 => locker.delete(&storage, ACCOUNT).await.unwrap(),
                    _ => match locker.status(&storage, ACCOUNT).await {
                        // a completed write is either a full loan or a full return
                        Ok(status) => assert_eq!(
                            status.is_available,
                            status.borrower_entity_id.is_empty(),
                            "torn read: {status:?}"
                        ),
                        Err(LibraryError::NotFound { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    },
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_different_accounts_do_not_block() {
        let storage: StorageHandle = Arc::new(MemoryStorage::new());
        let locks = Arc::new(KeyedLocks::new());
        let locker = ServiceAccountLocker::new(Arc::new(StorageHandler::new()), locks.clone());
        locker.check_in(&storage, "other@example.com").await.unwrap();

        let _held = locks.write(ACCOUNT).await;
        let status = tokio::time::timeout(
            Duration::from_secs(1),
            locker.status(&storage, "other@example.com"),
        )
        .await
        .expect("status on another account blocked");
        assert!(status.unwrap().is_available);

        let blocked = tokio::time::timeout(Duration::from_millis(50), locker.status(&storage, ACCOUNT)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_reclaim_is_noop_after_manual_check_in() {
        let storage: StorageHandle = Arc::new(MemoryStorage::new());
        let locker = ServiceAccountLocker::new(Arc::new(StorageHandler::new()), Arc::new(KeyedLocks::new()));

        locker
            .check_out(&storage, ACCOUNT, &loan(Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        locker.check_in(&storage, ACCOUNT).await.unwrap();

        assert_eq!(
            locker.reclaim_if_overdue(&storage, ACCOUNT).await.unwrap(),
            ReclaimOutcome::NotOnLoan
        );
    }
}
