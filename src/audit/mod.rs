//! Audit logging for Library Vault
//!
//! Every lending request is logged to SQLite: who asked (entity and peer
//! credentials), what they asked for (method, set, account) and how it went.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use thiserror::Error;

/// Audit logging errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single audit log entry
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Borrower entity, if the caller sent one
    pub entity_id: Option<String>,
    /// Peer process ID (from SO_PEERCRED)
    pub peer_pid: Option<i32>,
    /// Peer user ID (from SO_PEERCRED)
    pub peer_uid: Option<u32>,
    /// Protocol method
    pub method: String,
    pub set_name: Option<String>,
    /// Account lent, returned or renewed
    pub account: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl AuditEntry {
    /// Entry stamped now
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            entity_id: None,
            peer_pid: None,
            peer_uid: None,
            method: method.into(),
            set_name: None,
            account: None,
            success: true,
            error: None,
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT timestamp, entity_id, peer_pid, peer_uid, method, set_name, account, success, error FROM lending_log";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let timestamp_str: String = row.get(0)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(AuditEntry {
        timestamp,
        entity_id: row.get(1)?,
        peer_pid: row.get(2)?,
        peer_uid: row.get(3)?,
        method: row.get(4)?,
        set_name: row.get(5)?,
        account: row.get(6)?,
        success: row.get::<_, i32>(7)? != 0,
        error: row.get(8)?,
    })
}

/// Audit log backed by SQLite
pub struct AuditLog {
    db: Mutex<Connection>,
    /// Retention period in days (0 = forever)
    retention_days: u32,
}

impl AuditLog {
    pub fn new(db_path: &Path, retention_days: u32) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS lending_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                entity_id TEXT,
                peer_pid INTEGER,
                peer_uid INTEGER,
                method TEXT NOT NULL,
                set_name TEXT,
                account TEXT,
                success INTEGER NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_lending_log_timestamp ON lending_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_lending_log_account ON lending_log(account);
            CREATE INDEX IF NOT EXISTS idx_lending_log_set ON lending_log(set_name);
            "#,
        )?;

        let log = Self {
            db: Mutex::new(conn),
            retention_days,
        };
        log.cleanup_old_entries()?;
        Ok(log)
    }

    pub async fn log(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let db = self.db.lock().unwrap();

        db.execute(
            r#"
            INSERT INTO lending_log (
                timestamp, entity_id, peer_pid, peer_uid,
                method, set_name, account, success, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                entry.timestamp.to_rfc3339(),
                entry.entity_id,
                entry.peer_pid,
                entry.peer_uid,
                entry.method,
                entry.set_name,
                entry.account,
                entry.success as i32,
                entry.error,
            ],
        )?;

        if entry.success {
            tracing::debug!(
                entity = entry.entity_id,
                method = entry.method,
                set = entry.set_name,
                account = entry.account,
                "request served"
            );
        } else {
            tracing::warn!(
                entity = entry.entity_id,
                method = entry.method,
                set = entry.set_name,
                account = entry.account,
                error = entry.error,
                "request failed"
            );
        }

        Ok(())
    }

    /// Most recent entries first
    pub fn query_recent(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?"))?;
        let entries = stmt
            .query_map([limit as i64], entry_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    /// History of one account, most recent first
    pub fn query_by_account(&self, account: &str, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{SELECT_COLUMNS} WHERE account = ? ORDER BY id DESC LIMIT ?"
        ))?;
        let entries = stmt
            .query_map(params![account, limit as i64], entry_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    pub fn query_by_set(&self, set_name: &str, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{SELECT_COLUMNS} WHERE set_name = ? ORDER BY id DESC LIMIT ?"
        ))?;
        let entries = stmt
            .query_map(params![set_name, limit as i64], entry_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    pub fn get_stats(&self) -> Result<AuditStats, AuditError> {
        let db = self.db.lock().unwrap();
        let count = |sql: &str| -> Result<u64, AuditError> {
            let n: i64 = db.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        let total = count("SELECT COUNT(*) FROM lending_log")?;
        let success = count("SELECT COUNT(*) FROM lending_log WHERE success = 1")?;

        Ok(AuditStats {
            total_requests: total,
            success_count: success,
            failure_count: total - success,
            check_outs: count(
                "SELECT COUNT(*) FROM lending_log WHERE method = 'check_out' AND success = 1 AND account IS NOT NULL",
            )?,
            unique_borrowers: count(
                "SELECT COUNT(DISTINCT entity_id) FROM lending_log WHERE entity_id IS NOT NULL",
            )?,
            unique_accounts: count(
                "SELECT COUNT(DISTINCT account) FROM lending_log WHERE account IS NOT NULL",
            )?,
        })
    }

    /// Drop entries older than the retention period
    pub fn cleanup_old_entries(&self) -> Result<usize, AuditError> {
        if self.retention_days == 0 {
            return Ok(0);
        }

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
        let db = self.db.lock().unwrap();
        let deleted = db.execute(
            "DELETE FROM lending_log WHERE timestamp < ?",
            [cutoff.to_rfc3339()],
        )?;

        if deleted > 0 {
            tracing::info!(count = deleted, "cleaned up old audit log entries");
        }

        Ok(deleted)
    }
}

/// Audit log statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Successful check-outs that lent an account
    pub check_outs: u64,
    pub unique_borrowers: u64,
    pub unique_accounts: u64,
}
