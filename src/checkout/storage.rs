//! Innermost layer: checkout records in durable storage
//!
//! Assumes the caller serializes access per account. The locker above
//! provides that.

use async_trait::async_trait;

use super::{CheckOut, CheckOutHandler};
use crate::storage::{self, Storage, StorageHandle, CHECKOUT_PREFIX};
use crate::{LibraryError, Result};

/// Reads and writes `checkout/<account>` records
#[derive(Debug, Default)]
pub struct StorageHandler;

impl StorageHandler {
    pub fn new() -> Self {
        Self
    }
}

fn checkout_key(account: &str) -> String {
    format!("{CHECKOUT_PREFIX}{account}")
}

async fn load(storage: &StorageHandle, account: &str) -> Result<Option<CheckOut>> {
    Ok(storage::get_json(storage.as_ref(), &checkout_key(account)).await?)
}

#[async_trait]
impl CheckOutHandler for StorageHandler {
    async fn check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        if let Some(current) = load(storage, account).await? {
            if !current.is_available {
                return Err(LibraryError::AlreadyCheckedOut {
                    account: account.to_string(),
                });
            }
        }

        let record = CheckOut {
            is_available: false,
            ..checkout.clone()
        };
        storage::put_json(storage.as_ref(), &checkout_key(account), &record).await?;
        Ok(())
    }

    async fn renew_check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        match load(storage, account).await? {
            Some(current) if !current.is_available => {}
            _ => {
                return Err(LibraryError::NotCurrentlyCheckedOut {
                    account: account.to_string(),
                })
            }
        }

        let record = CheckOut {
            is_available: false,
            ..checkout.clone()
        };
        storage::put_json(storage.as_ref(), &checkout_key(account), &record).await?;
        Ok(())
    }

    async fn check_in(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        storage::put_json(storage.as_ref(), &checkout_key(account), &CheckOut::available()).await?;
        Ok(())
    }

    async fn status(&self, storage: &StorageHandle, account: &str) -> Result<CheckOut> {
        load(storage, account).await?.ok_or_else(|| LibraryError::NotFound {
            account: account.to_string(),
        })
    }

    async fn delete(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        storage.delete(&checkout_key(account)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::ReclaimOutcome;
    use crate::storage::MemoryStorage;
    use crate::test_support::{loan, ACCOUNT};
    use chrono::Utc;
    use std::sync::Arc;

    fn storage() -> StorageHandle {
        Arc::new(MemoryStorage::new())
    }

    #[tokio::test]
    async fn test_check_out_round_trip() {
        let storage = storage();
        let handler = StorageHandler::new();
        let checkout = loan(Utc::now() + chrono::Duration::hours(1));

        // never checked in, still lendable
        handler.check_out(&storage, ACCOUNT, &checkout).await.unwrap();
        assert_eq!(handler.status(&storage, ACCOUNT).await.unwrap(), checkout);
    }

    #[tokio::test]
    async fn test_double_check_out_fails() {
        let storage = storage();
        let handler = StorageHandler::new();
        let checkout = loan(Utc::now() + chrono::Duration::hours(1));

        handler.check_in(&storage, ACCOUNT).await.unwrap();
        handler.check_out(&storage, ACCOUNT, &checkout).await.unwrap();
        let err = handler.check_out(&storage, ACCOUNT, &checkout).await.unwrap_err();
        assert!(matches!(err, LibraryError::AlreadyCheckedOut { .. }));
    }

    #[tokio::test]
    async fn test_check_in_clears_borrower_and_is_idempotent() {
        let storage = storage();
        let handler = StorageHandler::new();

        handler
            .check_out(&storage, ACCOUNT, &loan(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        handler.check_in(&storage, ACCOUNT).await.unwrap();
        handler.check_in(&storage, ACCOUNT).await.unwrap();

        let status = handler.status(&storage, ACCOUNT).await.unwrap();
        assert!(status.is_available);
        assert!(status.borrower_entity_id.is_empty());
        assert!(status.borrower_client_token.is_empty());
    }

    #[tokio::test]
    async fn test_status_of_untracked_account() {
        let storage = storage();
        let err = StorageHandler::new().status(&storage, ACCOUNT).await.unwrap_err();
        assert!(matches!(err, LibraryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_renew_requires_loan() {
        let storage = storage();
        let handler = StorageHandler::new();
        let checkout = loan(Utc::now() + chrono::Duration::hours(1));

        let err = handler.renew_check_out(&storage, ACCOUNT, &checkout).await.unwrap_err();
        assert!(matches!(err, LibraryError::NotCurrentlyCheckedOut { .. }));

        handler.check_in(&storage, ACCOUNT).await.unwrap();
        let err = handler.renew_check_out(&storage, ACCOUNT, &checkout).await.unwrap_err();
        assert!(matches!(err, LibraryError::NotCurrentlyCheckedOut { .. }));

        handler.check_out(&storage, ACCOUNT, &checkout).await.unwrap();
        let renewed = loan(Utc::now() + chrono::Duration::hours(5));
        handler.renew_check_out(&storage, ACCOUNT, &renewed).await.unwrap();
        assert_eq!(handler.status(&storage, ACCOUNT).await.unwrap().due, renewed.due);
    }

    #[tokio::test]
    async fn test_delete_forgets_account() {
        let storage = storage();
        let handler = StorageHandler::new();

        handler.check_in(&storage, ACCOUNT).await.unwrap();
        handler.delete(&storage, ACCOUNT).await.unwrap();
        assert!(matches!(
            handler.status(&storage, ACCOUNT).await,
            Err(LibraryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reclaim_if_overdue() {
        let storage = storage();
        let handler = StorageHandler::new();

        assert_eq!(
            handler.reclaim_if_overdue(&storage, ACCOUNT).await.unwrap(),
            ReclaimOutcome::NotOnLoan
        );

        let due = Utc::now() + chrono::Duration::hours(1);
        handler.check_out(&storage, ACCOUNT, &loan(due)).await.unwrap();
        assert_eq!(
            handler.reclaim_if_overdue(&storage, ACCOUNT).await.unwrap(),
            ReclaimOutcome::NotDue(due)
        );

        handler
            .renew_check_out(&storage, ACCOUNT, &loan(Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(
            handler.reclaim_if_overdue(&storage, ACCOUNT).await.unwrap(),
            ReclaimOutcome::CheckedIn
        );
        assert!(handler.status(&storage, ACCOUNT).await.unwrap().is_available);
    }
}
