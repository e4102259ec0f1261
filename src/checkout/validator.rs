//! Outermost layer: reject malformed calls before they take any lock

use std::sync::Arc;

use async_trait::async_trait;

use super::{CheckOut, CheckOutHandler, ReclaimOutcome};
use crate::storage::StorageHandle;
use crate::{LibraryError, Result};

pub struct InputValidator {
    inner: Arc<dyn CheckOutHandler>,
}

impl InputValidator {
    pub fn new(inner: Arc<dyn CheckOutHandler>) -> Self {
        Self { inner }
    }
}

/// Account names become storage key suffixes
pub fn validate_account_name(account: &str) -> Result<()> {
    if account.is_empty() {
        return Err(LibraryError::Validation("service account name is required".to_string()));
    }
    if account.trim() != account {
        return Err(LibraryError::Validation(format!(
            "service account name {account:?} has surrounding whitespace"
        )));
    }
    if account.contains('/') {
        return Err(LibraryError::Validation(format!(
            "service account name {account:?} must not contain '/'"
        )));
    }
    Ok(())
}

fn validate_loan(checkout: &CheckOut) -> Result<()> {
    if checkout.is_available {
        return Err(LibraryError::Validation(
            "a check-out must not be marked available".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl CheckOutHandler for InputValidator {
    async fn check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        validate_account_name(account)?;
        validate_loan(checkout)?;
        self.inner.check_out(storage, account, checkout).await
    }

    async fn renew_check_out(&self, storage: &StorageHandle, account: &str, checkout: &CheckOut) -> Result<()> {
        validate_account_name(account)?;
        validate_loan(checkout)?;
        self.inner.renew_check_out(storage, account, checkout).await
    }

    async fn check_in(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        validate_account_name(account)?;
        self.inner.check_in(storage, account).await
    }

    async fn status(&self, storage: &StorageHandle, account: &str) -> Result<CheckOut> {
        validate_account_name(account)?;
        self.inner.status(storage, account).await
    }

    async fn delete(&self, storage: &StorageHandle, account: &str) -> Result<()> {
        validate_account_name(account)?;
        self.inner.delete(storage, account).await
    }

    async fn reclaim_if_overdue(&self, storage: &StorageHandle, account: &str) -> Result<ReclaimOutcome> {
        validate_account_name(account)?;
        self.inner.reclaim_if_overdue(storage, account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::StorageHandler;
    use crate::storage::MemoryStorage;
    use crate::test_support::{loan, ACCOUNT};
    use chrono::Utc;

    fn validator() -> (InputValidator, StorageHandle) {
        (
            InputValidator::new(Arc::new(StorageHandler::new())),
            Arc::new(MemoryStorage::new()),
        )
    }

    #[test]
    fn test_account_names() {
        assert!(validate_account_name(ACCOUNT).is_ok());
        for bad in ["", " padded", "padded ", "ou/account"] {
            assert!(
                matches!(validate_account_name(bad), Err(LibraryError::Validation(_))),
                "{bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_before_delegating() {
        let (validator, storage) = validator();

        let err = validator.check_in(&storage, "").await.unwrap_err();
        assert!(matches!(err, LibraryError::Validation(_)));
        // nothing was written
        assert!(matches!(
            validator.status(&storage, ACCOUNT).await,
            Err(LibraryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_available_payload() {
        let (validator, storage) = validator();
        let err = validator
            .check_out(&storage, ACCOUNT, &CheckOut::available())
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::Validation(_)));

        validator
            .check_out(&storage, ACCOUNT, &loan(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let err = validator
            .renew_check_out(&storage, ACCOUNT, &CheckOut::available())
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::Validation(_)));
    }
}
