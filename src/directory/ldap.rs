//! Active Directory client over LDAP
//!
//! Each call opens its own connection, binds as the configured DN, performs
//! the change and unbinds. Calls are rare (one per check-in) so there is no
//! connection pool.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use secrecy::{ExposeSecret, SecretString};

use super::{DirectoryClient, DirectoryError};
use crate::config::DirectoryConfig;

/// userAccountControl flag for a disabled account
const ACCOUNT_DISABLE: u32 = 1 << 1;

/// Seconds between 1601-01-01 (Windows epoch) and 1970-01-01
const WINDOWS_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// LDAP-backed directory client
#[derive(Debug, Default, Clone)]
pub struct LdapClient;

impl LdapClient {
    pub fn new() -> Self {
        Self
    }

    async fn connect(&self, conf: &DirectoryConfig) -> Result<Ldap, DirectoryError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(conf.request_timeout())
            .set_starttls(conf.starttls)
            .set_no_tls_verify(conf.insecure_tls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &conf.url).await?;
        ldap3::drive!(conn);

        ldap.simple_bind(&conf.bind_dn, &conf.bind_password)
            .await?
            .success()?;
        Ok(ldap)
    }

    /// Find the single entry for an account under `user_dn`
    async fn find_account(
        &self,
        ldap: &mut Ldap,
        conf: &DirectoryConfig,
        account: &str,
        attrs: Vec<&str>,
    ) -> Result<SearchEntry, DirectoryError> {
        let filter = format!("({}={})", conf.user_attr, ldap_escape(account));
        let (mut entries, _) = ldap
            .with_timeout(conf.request_timeout())
            .search(&conf.user_dn, Scope::Subtree, &filter, attrs)
            .await?
            .success()?;

        match entries.len() {
            0 => Err(DirectoryError::AccountNotFound {
                account: account.to_string(),
            }),
            1 => Ok(SearchEntry::construct(entries.remove(0))),
            count => Err(DirectoryError::Ambiguous {
                account: account.to_string(),
                count,
            }),
        }
    }

    async fn set_password(
        &self,
        ldap: &mut Ldap,
        dn: &str,
        password: &SecretString,
    ) -> Result<(), DirectoryError> {
        let encoded = encode_unicode_pwd(password.expose_secret());
        ldap.modify(
            dn,
            vec![Mod::Replace(b"unicodePwd".to_vec(), HashSet::from([encoded]))],
        )
        .await?
        .success()?;
        Ok(())
    }

    async fn set_disabled(
        &self,
        conf: &DirectoryConfig,
        account: &str,
        disabled: bool,
    ) -> Result<(), DirectoryError> {
        let mut ldap = self.connect(conf).await?;
        let entry = self
            .find_account(&mut ldap, conf, account, vec!["userAccountControl"])
            .await?;

        let current = first_attr(&entry, "userAccountControl")?;
        let uac: u32 = current.parse().map_err(|_| DirectoryError::InvalidAttribute {
            attribute: "userAccountControl".to_string(),
            value: current.to_string(),
        })?;
        let updated = toggle_disabled(uac, disabled);

        if updated != uac {
            ldap.modify(
                &entry.dn,
                vec![Mod::Replace(
                    "userAccountControl".to_string(),
                    HashSet::from([updated.to_string()]),
                )],
            )
            .await?
            .success()?;
        }

        tracing::info!(account = %account, disabled = disabled, "updated account state");
        let _ = ldap.unbind().await;
        Ok(())
    }
}

#[async_trait]
impl DirectoryClient for LdapClient {
    async fn update_password(
        &self,
        conf: &DirectoryConfig,
        account: &str,
        password: &SecretString,
    ) -> Result<(), DirectoryError> {
        let mut ldap = self.connect(conf).await?;
        let entry = self.find_account(&mut ldap, conf, account, vec!["dn"]).await?;
        self.set_password(&mut ldap, &entry.dn, password).await?;

        tracing::debug!(account = %account, dn = %entry.dn, "password updated in directory");
        let _ = ldap.unbind().await;
        Ok(())
    }

    async fn update_root_password(
        &self,
        conf: &DirectoryConfig,
        bind_dn: &str,
        password: &SecretString,
    ) -> Result<(), DirectoryError> {
        let mut ldap = self.connect(conf).await?;
        self.set_password(&mut ldap, bind_dn, password).await?;

        tracing::debug!(dn = %bind_dn, "root password updated in directory");
        let _ = ldap.unbind().await;
        Ok(())
    }

    async fn enable_account(&self, conf: &DirectoryConfig, account: &str) -> Result<(), DirectoryError> {
        self.set_disabled(conf, account, false).await
    }

    async fn disable_account(&self, conf: &DirectoryConfig, account: &str) -> Result<(), DirectoryError> {
        self.set_disabled(conf, account, true).await
    }

    async fn password_last_set(
        &self,
        conf: &DirectoryConfig,
        account: &str,
    ) -> Result<DateTime<Utc>, DirectoryError> {
        let mut ldap = self.connect(conf).await?;
        let entry = self
            .find_account(&mut ldap, conf, account, vec!["pwdLastSet"])
            .await?;
        let _ = ldap.unbind().await;

        parse_ticks(first_attr(&entry, "pwdLastSet")?)
    }
}

fn first_attr<'a>(entry: &'a SearchEntry, attribute: &str) -> Result<&'a str, DirectoryError> {
    entry
        .attrs
        .get(attribute)
        .and_then(|values| values.first())
        .map(String::as_str)
        .ok_or_else(|| DirectoryError::InvalidAttribute {
            attribute: attribute.to_string(),
            value: String::new(),
        })
}

/// AD wants the password quoted and encoded as UTF-16LE
fn encode_unicode_pwd(password: &str) -> Vec<u8> {
    format!("\"{password}\"")
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

fn toggle_disabled(uac: u32, disabled: bool) -> u32 {
    if disabled {
        uac | ACCOUNT_DISABLE
    } else {
        uac & !ACCOUNT_DISABLE
    }
}

/// Parse a Windows FILETIME (100ns ticks since 1601) into UTC
fn parse_ticks(raw: &str) -> Result<DateTime<Utc>, DirectoryError> {
    let invalid = || DirectoryError::InvalidAttribute {
        attribute: "pwdLastSet".to_string(),
        value: raw.to_string(),
    };

    let ticks: i64 = raw.trim().parse().map_err(|_| invalid())?;
    let secs = ticks / 10_000_000 - WINDOWS_EPOCH_OFFSET_SECS;
    let nanos = (ticks % 10_000_000) * 100;
    DateTime::from_timestamp(secs, nanos as u32).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_unicode_pwd() {
        let encoded = encode_unicode_pwd("ab");
        assert_eq!(encoded, vec![b'"', 0, b'a', 0, b'b', 0, b'"', 0]);
    }

    #[test]
    fn test_parse_ticks() {
        let parsed = parse_ticks("131680504285591921").unwrap();
        assert_eq!(
            parsed.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            "2018-04-12T23:47:08.559192100Z"
        );
        assert!(parse_ticks("never").is_err());
    }

    #[test]
    fn test_toggle_disabled() {
        let normal = 512;
        assert_eq!(toggle_disabled(normal, true), 514);
        assert_eq!(toggle_disabled(514, false), 512);
        assert_eq!(toggle_disabled(normal, false), normal);
    }

    #[tokio::test]
    #[ignore = "requires a reachable directory server"]
    async fn test_update_password_against_directory() {
        let conf = DirectoryConfig {
            url: std::env::var("LIBRARY_VAULT_TEST_LDAP_URL").unwrap(),
            bind_dn: std::env::var("LIBRARY_VAULT_TEST_BIND_DN").unwrap(),
            bind_password: std::env::var("LIBRARY_VAULT_TEST_BIND_PASSWORD").unwrap(),
            user_dn: std::env::var("LIBRARY_VAULT_TEST_USER_DN").unwrap(),
            user_attr: "userPrincipalName".to_string(),
            starttls: false,
            insecure_tls: true,
            request_timeout_secs: 10,
            last_bind_password: None,
            last_bind_password_rotation: None,
        };
        let account = std::env::var("LIBRARY_VAULT_TEST_ACCOUNT").unwrap();
        let password = crate::password::generate_password("", 20).unwrap();

        let client = LdapClient::new();
        client
            .update_password(&conf, &account, &SecretString::from(password))
            .await
            .unwrap();
        assert!(client.password_last_set(&conf, &account).await.is_ok());
    }
}
