//! Request/Response protocol for Library Vault
//!
//! All communication happens over Unix sockets using newline-delimited JSON.
//! Each message is a single JSON object followed by a newline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::library::{AccountStatus, LibrarySet, SetParams};
use crate::roles::{RoleParams, StaticRole};
use crate::LibraryError;

/// A request to the library daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID for correlation
    pub id: String,
    /// The caller's client token, recorded as the borrower's token
    #[serde(default)]
    pub auth: String,
    /// The caller's entity, recorded as the borrower
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub method: Method,
    #[serde(default)]
    pub params: Params,
}

/// Available methods
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Borrow any available account from a set
    CheckOut,
    /// Return accounts the caller borrowed
    CheckIn,
    /// Return accounts regardless of who borrowed them
    ManageCheckIn,
    /// Loan state of every account in a set
    Status,
    /// Extend a loan
    Renew,
    /// End a loan early
    Return,
    /// Create or update a set
    WriteSet,
    ReadSet,
    DeleteSet,
    ListSets,
    /// Rotate the directory bind password
    RotateRoot,
    ReadConfig,
    WriteConfig,
    Health,
    /// Create or update a static role
    WriteRole,
    ReadRole,
    DeleteRole,
    ListRoles,
    /// Current and previous password of a static role, rotating when due
    ReadCreds,
    /// Rotate a static role's password now
    RotateRole,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::CheckOut => "check_out",
            Method::CheckIn => "check_in",
            Method::ManageCheckIn => "manage_check_in",
            Method::Status => "status",
            Method::Renew => "renew",
            Method::Return => "return",
            Method::WriteSet => "write_set",
            Method::ReadSet => "read_set",
            Method::DeleteSet => "delete_set",
            Method::ListSets => "list_sets",
            Method::RotateRoot => "rotate_root",
            Method::ReadConfig => "read_config",
            Method::WriteConfig => "write_config",
            Method::Health => "health",
            Method::WriteRole => "write_role",
            Method::ReadRole => "read_role",
            Method::DeleteRole => "delete_role",
            Method::ListRoles => "list_roles",
            Method::ReadCreds => "read_creds",
            Method::RotateRole => "rotate_role",
        }
    }

    /// Methods a follower may serve
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Method::Status
                | Method::ReadSet
                | Method::ListSets
                | Method::ReadConfig
                | Method::Health
                | Method::ReadRole
                | Method::ListRoles
        )
    }
}

/// Method parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Params {
    /// Set name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,

    /// Static role name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Account a static role manages (write_role)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Single account (renew, return)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Accounts to check in, or the members of a set being written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_names: Option<Vec<String>>,

    /// Requested loan length (check_out), set TTL (write_set) or role
    /// rotation period (write_role), seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_check_in_enforcement: Option<bool>,

    /// Renewal increment in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub increment: Option<u64>,

    /// Engine config (write_config)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<EngineConfig>,
}

impl Params {
    /// The set fields of a write_set request
    pub fn set_params(&self) -> SetParams {
        SetParams {
            service_account_names: self.service_account_names.clone(),
            ttl: self.ttl,
            max_ttl: self.max_ttl,
            disable_check_in_enforcement: self.disable_check_in_enforcement,
        }
    }

    /// The role fields of a write_role request
    pub fn role_params(&self) -> RoleParams {
        RoleParams {
            service_account_name: self.service_account_name.clone(),
            ttl: self.ttl,
        }
    }
}

/// A response from the library daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Request ID for correlation
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// Successful response result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseResult {
    Lease(LeaseResult),
    CheckIn(CheckInResult),
    Status(StatusResult),
    Set(LibrarySet),
    Config(EngineConfig),
    Health(HealthResult),
    List(ListResult),
    Renewed(RenewResult),
    Role(RoleResult),
    Creds(CredsResult),
    RoleList(RoleListResult),
    Ok(OkResult),
}

/// Credentials for a borrowed account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResult {
    pub service_account_name: String,
    pub password: String,
    pub ttl: u64,
    pub max_ttl: u64,
    pub renewable: bool,
    pub due: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInResult {
    pub check_ins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub accounts: BTreeMap<String, AccountStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewResult {
    pub due: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub sets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleResult {
    pub name: String,
    #[serde(flatten)]
    pub role: StaticRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredsResult {
    pub username: String,
    pub current_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleListResult {
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: String,
    /// `leader` or `follower`
    pub role: String,
    pub uptime_seconds: u64,
    /// Loans with an armed overdue timer
    pub watched_accounts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResult {
    pub success: bool,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
}

/// Error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid request format
    InvalidRequest,
    MissingParameter,
    /// Set or account not found
    NotFound,
    /// Every account in the set is on loan, retry later
    Unavailable,
    /// Account state doesn't allow the operation
    Conflict,
    /// Caller isn't the borrower, or the node is read-only
    Forbidden,
    /// Some of the requested changes were applied
    PartiallyApplied,
    /// The directory rejected or failed a change
    DirectoryError,
    StorageError,
    InternalError,
}

impl From<&LibraryError> for ErrorCode {
    fn from(e: &LibraryError) -> Self {
        match e {
            LibraryError::NotFound { .. } | LibraryError::SetNotFound { .. } | LibraryError::RoleNotFound { .. } => {
                ErrorCode::NotFound
            }
            LibraryError::AlreadyCheckedOut { .. } | LibraryError::NotCurrentlyCheckedOut { .. } => {
                ErrorCode::Conflict
            }
            LibraryError::NotBorrower { .. } => ErrorCode::Forbidden,
            LibraryError::Validation(_) | LibraryError::Password(_) | LibraryError::ConfigUnset => {
                ErrorCode::InvalidRequest
            }
            LibraryError::PartiallyApplied { .. } => ErrorCode::PartiallyApplied,
            LibraryError::RemoteUpdate(_) | LibraryError::RootRollbackFailed { .. } => ErrorCode::DirectoryError,
            LibraryError::Storage(_) => ErrorCode::StorageError,
            LibraryError::Rotation(crate::rotation::RotationError::InProgress) => ErrorCode::Conflict,
            _ => ErrorCode::InternalError,
        }
    }
}

impl Request {
    fn new(id: impl Into<String>, auth: impl Into<String>, method: Method, params: Params) -> Self {
        Self {
            id: id.into(),
            auth: auth.into(),
            entity_id: None,
            method,
            params,
        }
    }

    pub fn with_entity(mut self, entity_id: Option<String>) -> Self {
        self.entity_id = entity_id;
        self
    }

    pub fn check_out(
        id: impl Into<String>,
        auth: impl Into<String>,
        set: impl Into<String>,
        ttl: Option<u64>,
    ) -> Self {
        Self::new(
            id,
            auth,
            Method::CheckOut,
            Params {
                set: Some(set.into()),
                ttl,
                ..Default::default()
            },
        )
    }

    /// `force` uses the manage path, which skips borrower enforcement
    pub fn check_in(
        id: impl Into<String>,
        auth: impl Into<String>,
        set: impl Into<String>,
        accounts: Vec<String>,
        force: bool,
    ) -> Self {
        let method = if force { Method::ManageCheckIn } else { Method::CheckIn };
        Self::new(
            id,
            auth,
            method,
            Params {
                set: Some(set.into()),
                service_account_names: (!accounts.is_empty()).then_some(accounts),
                ..Default::default()
            },
        )
    }

    /// Requests that only name a set: status, read_set, delete_set
    pub fn for_set(id: impl Into<String>, auth: impl Into<String>, method: Method, set: impl Into<String>) -> Self {
        Self::new(
            id,
            auth,
            method,
            Params {
                set: Some(set.into()),
                ..Default::default()
            },
        )
    }

    /// Requests on a single lent account: renew, return
    pub fn for_account(
        id: impl Into<String>,
        auth: impl Into<String>,
        method: Method,
        set: impl Into<String>,
        account: impl Into<String>,
        increment: Option<u64>,
    ) -> Self {
        Self::new(
            id,
            auth,
            method,
            Params {
                set: Some(set.into()),
                account: Some(account.into()),
                increment,
                ..Default::default()
            },
        )
    }

    pub fn write_set(id: impl Into<String>, auth: impl Into<String>, set: impl Into<String>, fields: SetParams) -> Self {
        Self::new(
            id,
            auth,
            Method::WriteSet,
            Params {
                set: Some(set.into()),
                service_account_names: fields.service_account_names,
                ttl: fields.ttl,
                max_ttl: fields.max_ttl,
                disable_check_in_enforcement: fields.disable_check_in_enforcement,
                ..Default::default()
            },
        )
    }

    pub fn write_config(id: impl Into<String>, auth: impl Into<String>, config: EngineConfig) -> Self {
        Self::new(
            id,
            auth,
            Method::WriteConfig,
            Params {
                config: Some(config),
                ..Default::default()
            },
        )
    }

    /// Requests that only name a role: read_role, delete_role, read_creds, rotate_role
    pub fn for_role(id: impl Into<String>, auth: impl Into<String>, method: Method, role: impl Into<String>) -> Self {
        Self::new(
            id,
            auth,
            method,
            Params {
                role: Some(role.into()),
                ..Default::default()
            },
        )
    }

    pub fn write_role(id: impl Into<String>, auth: impl Into<String>, role: impl Into<String>, fields: RoleParams) -> Self {
        Self::new(
            id,
            auth,
            Method::WriteRole,
            Params {
                role: Some(role.into()),
                service_account_name: fields.service_account_name,
                ttl: fields.ttl,
                ..Default::default()
            },
        )
    }

    /// Requests without parameters: list_sets, list_roles, rotate_root, read_config, health
    pub fn simple(id: impl Into<String>, auth: impl Into<String>, method: Method) -> Self {
        Self::new(id, auth, method, Params::default())
    }
}

impl Response {
    fn success(id: impl Into<String>, result: ResponseResult) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn lease(id: impl Into<String>, lease: LeaseResult) -> Self {
        Self::success(id, ResponseResult::Lease(lease))
    }

    pub fn check_ins(id: impl Into<String>, check_ins: Vec<String>) -> Self {
        Self::success(id, ResponseResult::CheckIn(CheckInResult { check_ins }))
    }

    pub fn status(id: impl Into<String>, accounts: BTreeMap<String, AccountStatus>) -> Self {
        Self::success(id, ResponseResult::Status(StatusResult { accounts }))
    }

    pub fn renewed(id: impl Into<String>, due: DateTime<Utc>) -> Self {
        Self::success(id, ResponseResult::Renewed(RenewResult { due }))
    }

    pub fn set(id: impl Into<String>, set: LibrarySet) -> Self {
        Self::success(id, ResponseResult::Set(set))
    }

    pub fn config(id: impl Into<String>, config: EngineConfig) -> Self {
        Self::success(id, ResponseResult::Config(config))
    }

    pub fn list(id: impl Into<String>, sets: Vec<String>) -> Self {
        Self::success(id, ResponseResult::List(ListResult { sets }))
    }

    pub fn role(id: impl Into<String>, name: impl Into<String>, role: StaticRole) -> Self {
        Self::success(id, ResponseResult::Role(RoleResult { name: name.into(), role }))
    }

    pub fn creds(id: impl Into<String>, creds: CredsResult) -> Self {
        Self::success(id, ResponseResult::Creds(creds))
    }

    pub fn roles(id: impl Into<String>, roles: Vec<String>) -> Self {
        Self::success(id, ResponseResult::RoleList(RoleListResult { roles }))
    }

    pub fn health(id: impl Into<String>, role: &str, uptime_seconds: u64, watched_accounts: usize) -> Self {
        Self::success(
            id,
            ResponseResult::Health(HealthResult {
                status: "ok".to_string(),
                role: role.to_string(),
                uptime_seconds,
                watched_accounts,
            }),
        )
    }

    pub fn ok(id: impl Into<String>) -> Self {
        Self::success(id, ResponseResult::Ok(OkResult { success: true }))
    }

    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::check_out("req-1", "token123", "dba", Some(600)).with_entity(Some("ent-1".to_string()));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"check_out\""));
        assert!(json.contains("\"set\":\"dba\""));
        assert!(json.contains("\"entity_id\":\"ent-1\""));
        assert!(!json.contains("increment"));
    }

    #[test]
    fn test_forced_check_in_uses_manage_method() {
        let req = Request::check_in("req-1", "t", "dba", vec![], true);
        assert_eq!(req.method, Method::ManageCheckIn);
        assert!(req.params.service_account_names.is_none());
    }

    #[test]
    fn test_minimal_request_parses() {
        let req: Request = serde_json::from_str(r#"{"id":"1","method":"list_sets"}"#).unwrap();
        assert_eq!(req.method, Method::ListSets);
        assert!(req.auth.is_empty());
        assert!(req.method.is_read_only());
        assert!(!Method::CheckOut.is_read_only());
        assert!(Method::ReadRole.is_read_only());
        // may rotate
        assert!(!Method::ReadCreds.is_read_only());
    }

    #[test]
    fn test_results_parse_back_to_their_variant() {
        let lease = Response::lease(
            "1",
            LeaseResult {
                service_account_name: "svc".to_string(),
                password: "pw".to_string(),
                ttl: 60,
                max_ttl: 120,
                renewable: true,
                due: Utc::now(),
            },
        );
        let parsed: Response = serde_json::from_str(&serde_json::to_string(&lease).unwrap()).unwrap();
        assert!(matches!(parsed.result, Some(ResponseResult::Lease(_))));

        let renewed = Response::renewed("2", Utc::now());
        let parsed: Response = serde_json::from_str(&serde_json::to_string(&renewed).unwrap()).unwrap();
        assert!(matches!(parsed.result, Some(ResponseResult::Renewed(_))));

        let health = Response::health("3", "leader", 5, 2);
        let parsed: Response = serde_json::from_str(&serde_json::to_string(&health).unwrap()).unwrap();
        assert!(matches!(parsed.result, Some(ResponseResult::Health(_))));

        let role = Response::role(
            "4",
            "app",
            StaticRole {
                service_account_name: "svc@example.com".to_string(),
                ttl: 60,
                last_vault_rotation: None,
                password_last_set: Some(Utc::now()),
            },
        );
        let parsed: Response = serde_json::from_str(&serde_json::to_string(&role).unwrap()).unwrap();
        let Some(ResponseResult::Role(result)) = parsed.result else {
            panic!("expected a role");
        };
        assert_eq!(result.name, "app");
        assert_eq!(result.role.ttl, 60);

        let creds = Response::creds(
            "5",
            CredsResult {
                username: "svc".to_string(),
                current_password: "pw".to_string(),
                last_password: None,
            },
        );
        let parsed: Response = serde_json::from_str(&serde_json::to_string(&creds).unwrap()).unwrap();
        assert!(matches!(parsed.result, Some(ResponseResult::Creds(_))));

        let roles = Response::roles("6", vec!["app".to_string()]);
        let parsed: Response = serde_json::from_str(&serde_json::to_string(&roles).unwrap()).unwrap();
        assert!(matches!(parsed.result, Some(ResponseResult::RoleList(_))));
    }

    #[test]
    fn test_error_response() {
        let resp = Response::error("req-1", ErrorCode::Unavailable, "no accounts available");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"code\":\"unavailable\""));
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn test_error_codes() {
        let code = |e: LibraryError| ErrorCode::from(&e);
        assert_eq!(code(LibraryError::SetNotFound { name: "s".into() }), ErrorCode::NotFound);
        assert_eq!(code(LibraryError::NotBorrower { account: "a".into() }), ErrorCode::Forbidden);
        assert_eq!(code(LibraryError::RoleNotFound { name: "r".into() }), ErrorCode::NotFound);
        assert_eq!(code(LibraryError::ConfigUnset), ErrorCode::InvalidRequest);
        assert_eq!(
            code(LibraryError::NotCurrentlyCheckedOut { account: "a".into() }),
            ErrorCode::Conflict
        );
    }
}
