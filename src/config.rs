//! Configuration loading for Library Vault
//!
//! Two layers of configuration exist:
//! - The daemon config, loaded from a TOML file with defaults that work out
//!   of the box.
//! - The engine config (directory connection and password policy), persisted
//!   in storage so every node reads the same values. The daemon config may
//!   carry an `[engine]` section used to seed storage on first start.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::{self, Storage, StorageError, CONFIG_KEY};
use crate::LibraryError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Lending behaviour
    pub lending: LendingConfig,
    /// Audit logging configuration
    pub audit: AuditConfig,
    /// Alerting configuration
    pub alerting: AlertingConfig,
    /// Engine config used to seed storage
    pub engine: Option<EngineConfig>,
}

/// Whether this node mutates state or only serves reads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Follower,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,
    /// Socket file permissions (octal)
    pub socket_mode: u32,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Node role
    pub role: Role,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Path to SQLite database
    pub db_path: PathBuf,
}

/// Lending configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LendingConfig {
    /// Wait between attempts to reclaim an overdue account
    pub overdue_retry_secs: u64,
    /// Cron schedule for the password recovery sweep
    pub reconcile_schedule: String,
    /// Attempts to restore the previous root password
    pub root_rollback_attempts: u32,
    /// Backoff unit for root rollback (attempt i waits i^2 units)
    pub root_rollback_backoff_ms: u64,
}

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Enable audit logging
    pub enabled: bool,
    /// Path to SQLite database
    pub db_path: PathBuf,
    /// Retention period in days (0 = forever)
    pub retention_days: u32,
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Enable alerting
    pub enabled: bool,
    /// Storage key holding the Telegram bot token
    pub telegram_token_key: Option<String>,
    /// Telegram chat ID for alerts
    pub telegram_chat_id: Option<i64>,
}

/// Engine configuration persisted at [`CONFIG_KEY`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub password: PasswordConfig,
}

/// Connection settings for the directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// LDAP URL, e.g. `ldaps://dc1.example.com`
    pub url: String,
    /// DN used to bind, also the root credential rotated by `rotate_root`
    pub bind_dn: String,
    pub bind_password: String,
    /// Search base for service accounts
    pub user_dn: String,
    /// Attribute matched against account names
    #[serde(default = "default_user_attr")]
    pub user_attr: String,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Bind password before the last root rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bind_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bind_password_rotation: Option<chrono::DateTime<chrono::Utc>>,
}

/// Password policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PasswordConfig {
    /// Total password length
    pub length: usize,
    /// Optional template containing `{{PASSWORD}}`
    pub formatter: String,
    /// Default rotation period for static roles, seconds
    pub ttl: u64,
    /// Longest rotation period a static role may ask for, seconds, 0 = no cap
    pub max_ttl: u64,
}

/// Default static role rotation period and ceiling (32 days)
pub const DEFAULT_ROLE_TTL_SECS: u64 = 32 * 24 * 60 * 60;

fn default_user_attr() -> String {
    "userPrincipalName".to_string()
}

fn default_request_timeout() -> u64 {
    90
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            lending: LendingConfig::default(),
            audit: AuditConfig::default(),
            alerting: AlertingConfig::default(),
            engine: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        // Use XDG_RUNTIME_DIR if available, otherwise /tmp
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));

        Self {
            socket_path: runtime_dir.join("library-vault.sock"),
            socket_mode: 0o600,
            max_connections: 100,
            request_timeout_secs: 30,
            role: Role::Leader,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            db_path: data_dir().join("library.db"),
        }
    }
}

impl Default for LendingConfig {
    fn default() -> Self {
        Self {
            overdue_retry_secs: 60,
            reconcile_schedule: "0 * * * * *".to_string(), // every minute
            root_rollback_attempts: 10,
            root_rollback_backoff_ms: 1000,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: data_dir().join("audit.db"),
            retention_days: 90,
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            telegram_token_key: Some("alerting/telegram-bot".to_string()),
            telegram_chat_id: None,
        }
    }
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            length: 64,
            formatter: String::new(),
            ttl: DEFAULT_ROLE_TTL_SECS,
            max_ttl: DEFAULT_ROLE_TTL_SECS,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("library-vault"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/library-vault"))
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self, LibraryError> {
        let config_path = path.cloned().unwrap_or_else(|| {
            dirs::config_dir()
                .map(|d| d.join("library-vault").join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("/etc/library-vault/config.toml"))
        });

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .map_err(|e| LibraryError::Config(format!("failed to read config: {e}")))?;
            let config: Config = toml::from_str(&contents)
                .map_err(|e| LibraryError::Config(format!("failed to parse config: {e}")))?;
            Ok(config)
        } else {
            tracing::info!("no config file found at {}, using defaults", config_path.display());
            Ok(Config::default())
        }
    }

    pub fn is_leader(&self) -> bool {
        self.server.role == Role::Leader
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the overdue retry interval as Duration
    pub fn overdue_retry(&self) -> Duration {
        Duration::from_secs(self.lending.overdue_retry_secs)
    }
}

impl DirectoryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl EngineConfig {
    /// Copy safe to hand back to callers
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.directory.bind_password = String::new();
        copy.directory.last_bind_password = None;
        copy
    }

    /// Check the password policy can actually produce passwords
    pub fn validate(&self) -> Result<(), LibraryError> {
        if self.directory.url.is_empty() {
            return Err(LibraryError::Validation("directory url is required".to_string()));
        }
        if self.directory.bind_dn.is_empty() {
            return Err(LibraryError::Validation("bind dn is required".to_string()));
        }
        crate::password::validate_policy(&self.password.formatter, self.password.length)?;
        if self.password.max_ttl > 0 && self.password.ttl > self.password.max_ttl {
            return Err(LibraryError::Validation(format!(
                "password ttl ({} seconds) may not exceed max_ttl ({} seconds)",
                self.password.ttl, self.password.max_ttl
            )));
        }
        Ok(())
    }
}

/// Read the engine config, `None` when unset
pub async fn read_engine_config(storage: &dyn Storage) -> Result<Option<EngineConfig>, StorageError> {
    storage::get_json(storage, CONFIG_KEY).await
}

/// Persist the engine config
pub async fn write_engine_config(storage: &dyn Storage, config: &EngineConfig) -> Result<(), StorageError> {
    storage::put_json(storage, CONFIG_KEY, config).await
}

/// Store `seed` unless an engine config is already persisted. Returns
/// whether anything was written.
pub async fn seed_engine_config(storage: &dyn Storage, seed: Option<&EngineConfig>) -> Result<bool, LibraryError> {
    let Some(seed) = seed else {
        return Ok(false);
    };
    if read_engine_config(storage).await?.is_some() {
        return Ok(false);
    }
    seed.validate()?;
    write_engine_config(storage, seed).await?;
    tracing::info!(url = %seed.directory.url, "seeded engine config");
    Ok(true)
}
