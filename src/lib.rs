//! Library Vault - Lending library for privileged directory service accounts
//!
//! Callers borrow one account at a time from a named set. Returning an
//! account rotates its password in the directory, and loans that run past
//! their due time are reclaimed automatically.

pub mod alerting;
pub mod audit;
pub mod checkout;
pub mod config;
pub mod directory;
pub mod library;
pub mod password;
pub mod protocol;
pub mod roles;
pub mod rotation;
pub mod server;
pub mod storage;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_support;

use thiserror::Error;

/// Main error type for Library Vault operations
#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("{account} is currently checked out")]
    AlreadyCheckedOut { account: String },

    #[error("{account} is not currently checked out")]
    NotCurrentlyCheckedOut { account: String },

    #[error("{account} is not tracked")]
    NotFound { account: String },

    #[error("{account:?} wasn't checked out by the caller")]
    NotBorrower { account: String },

    #[error("set {name:?} doesn't exist")]
    SetNotFound { name: String },

    #[error("role {name:?} doesn't exist")]
    RoleNotFound { name: String },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{}", .errors.join("; "))]
    PartiallyApplied { errors: Vec<String> },

    #[error("the engine config is currently unset")]
    ConfigUnset,

    #[error(
        "unable to store new root password due to {store_error} and unable to return to the \
         previous password due to {rollback_error}, configure a new bind dn and bind password \
         to restore directory access"
    )]
    RootRollbackFailed {
        store_error: String,
        rollback_error: String,
    },

    #[error("directory error: {0}")]
    RemoteUpdate(#[from] directory::DirectoryError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("password error: {0}")]
    Password(#[from] password::PasswordError),

    #[error("audit error: {0}")]
    Audit(#[from] audit::AuditError),

    #[error("{0}")]
    Rotation(#[from] rotation::RotationError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for Library Vault operations
pub type Result<T> = std::result::Result<T, LibraryError>;
