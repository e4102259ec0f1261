//! Operator alerts
//!
//! Sends Telegram notifications when:
//! - An overdue account cannot be reclaimed
//! - The reconciliation sweep leaves password rotations pending
//! - A root credential rollback fails and directory access may be lost
//!
//! Includes rate limiting to prevent alert floods.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::storage::Storage;

/// Alerting trait
pub trait Alerter: Send + Sync {
    /// Send an alert
    fn alert(&self, message: &str, severity: AlertSeverity);
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    fn emoji(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "ℹ️",
            AlertSeverity::Warning => "⚠️",
            AlertSeverity::Error => "❌",
            AlertSeverity::Critical => "🚨",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "Info",
            AlertSeverity::Warning => "Warning",
            AlertSeverity::Error => "Error",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// Telegram alerter that sends messages via the Telegram Bot API.
///
/// Rate-limits to at most one alert per `min_interval`. Critical alerts
/// always go through.
pub struct TelegramAlerter {
    bot_token: String,
    chat_id: i64,
    min_interval: Duration,
    last_alert: Mutex<Option<Instant>>,
    client: reqwest::Client,
}

impl TelegramAlerter {
    pub fn new(bot_token: String, chat_id: i64) -> Self {
        Self {
            bot_token,
            chat_id,
            min_interval: Duration::from_secs(60),
            last_alert: Mutex::new(None),
            client: reqwest::Client::new(),
        }
    }

    /// Build a TelegramAlerter by reading the bot token from storage at
    /// startup. Returns `None` if alerting is not configured.
    pub async fn from_config(
        config: &crate::config::AlertingConfig,
        storage: &dyn Storage,
    ) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let chat_id = config.telegram_chat_id?;
        let token_key = config.telegram_token_key.as_ref()?;

        let bot_token = match storage.get(token_key).await {
            Ok(Some(token)) => token.trim().to_string(),
            Ok(None) => {
                tracing::warn!(key = %token_key, "telegram bot token not stored, alerting disabled");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    key = %token_key,
                    "failed to read telegram bot token, alerting disabled"
                );
                return None;
            }
        };

        Some(Self::new(bot_token, chat_id))
    }

    fn is_rate_limited(&self, severity: AlertSeverity) -> bool {
        let mut last = self.last_alert.lock().unwrap();
        if let Some(t) = *last {
            if t.elapsed() < self.min_interval && severity != AlertSeverity::Critical {
                return true;
            }
        }
        *last = Some(Instant::now());
        false
    }
}

impl Alerter for TelegramAlerter {
    fn alert(&self, message: &str, severity: AlertSeverity) {
        if self.is_rate_limited(severity) {
            tracing::debug!("alert rate-limited, skipping");
            return;
        }

        let text = format!(
            "{} *library-vault* {}\n\n{}",
            severity.emoji(),
            severity.label(),
            message
        );

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let chat_id = self.chat_id;
        let client = self.client.clone();

        // Fire-and-forget: don't block the caller
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "Markdown",
                }))
                .send()
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "failed to send telegram alert");
            }
        });
    }
}

/// A no-op alerter used when alerting is disabled.
pub struct NoopAlerter;

impl Alerter for NoopAlerter {
    fn alert(&self, _message: &str, _severity: AlertSeverity) {}
}

#[cfg(test)]
pub mod mock {
    use super::*;

    /// Alerter that remembers what it was asked to send
    #[derive(Default)]
    pub struct RecordingAlerter {
        alerts: Mutex<Vec<(AlertSeverity, String)>>,
    }

    impl RecordingAlerter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn alerts(&self) -> Vec<(AlertSeverity, String)> {
            self.alerts.lock().unwrap().clone()
        }

        pub fn count(&self, severity: AlertSeverity) -> usize {
            self.alerts
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == severity)
                .count()
        }
    }

    impl Alerter for RecordingAlerter {
        fn alert(&self, message: &str, severity: AlertSeverity) {
            self.alerts.lock().unwrap().push((severity, message.to_string()));
        }
    }
}
