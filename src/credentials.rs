// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Credential resolution for opaque inbox ids.
//!
//! A pure lookup over the configuration backing store. Credentials are
//! produced on demand and never persisted by the core; the session store only
//! ever sees the inbox hash.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::config::{AuthKindConfig, InboxConfig, Settings};
use crate::error::ProxyError;
use crate::ids::inbox_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Password,
    OauthBearer,
}

/// Immutable upstream credentials for one protocol endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub secret: String,
    pub auth_kind: AuthKind,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.token_expires_at, Some(t) if t <= now)
    }
}

pub struct CredentialResolver {
    inboxes: HashMap<String, InboxConfig>,
}

impl CredentialResolver {
    pub fn new(settings: &Settings) -> Self {
        Self {
            inboxes: settings.inboxes.clone(),
        }
    }

    /// Resolve IMAP credentials for an inbox id.
    ///
    /// Refuses to hand out OAuth tokens already past expiry; callers get
    /// `CredentialExpired` instead of a guaranteed upstream AUTH failure.
    pub fn resolve_imap(&self, inbox_id: &str) -> Result<Credentials, ProxyError> {
        let cfg = self.lookup(inbox_id)?;
        self.build(cfg, cfg.imap_host.clone(), cfg.imap_port, inbox_id)
    }

    /// Resolve SMTP submission credentials for an inbox id.
    pub fn resolve_smtp(&self, inbox_id: &str) -> Result<Credentials, ProxyError> {
        let cfg = self.lookup(inbox_id)?;
        self.build(cfg, cfg.smtp_host.clone(), cfg.smtp_port, inbox_id)
    }

    /// OAuth token expiry for an inbox, if it authenticates with one.
    /// Used by the keep-alive worker to warn ahead of expiry.
    pub fn token_expiry(&self, inbox_id: &str) -> Option<DateTime<Utc>> {
        let cfg = self.inboxes.get(inbox_id)?;
        match cfg.auth {
            AuthKindConfig::OauthBearer => from_unix_ms(cfg.token_expires_at_ms?),
            AuthKindConfig::Password => None,
        }
    }

    pub fn knows(&self, inbox_id: &str) -> bool {
        self.inboxes.contains_key(inbox_id)
    }

    fn lookup(&self, inbox_id: &str) -> Result<&InboxConfig, ProxyError> {
        self.inboxes
            .get(inbox_id)
            .ok_or_else(|| ProxyError::NotFound(inbox_hash(inbox_id)))
    }

    fn build(
        &self,
        cfg: &InboxConfig,
        host: String,
        port: u16,
        inbox_id: &str,
    ) -> Result<Credentials, ProxyError> {
        let creds = Credentials {
            host,
            port,
            user: cfg.user.clone(),
            secret: cfg.secret.clone(),
            auth_kind: match cfg.auth {
                AuthKindConfig::Password => AuthKind::Password,
                AuthKindConfig::OauthBearer => AuthKind::OauthBearer,
            },
            token_expires_at: cfg.token_expires_at_ms.and_then(from_unix_ms),
        };
        if creds.auth_kind == AuthKind::OauthBearer && creds.is_expired(Utc::now()) {
            return Err(ProxyError::CredentialExpired(inbox_hash(inbox_id)));
        }
        Ok(creds)
    }
}

fn from_unix_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(auth: AuthKindConfig, token_expires_at_ms: Option<i64>) -> Settings {
        let mut settings = Settings::default();
        settings.inboxes.insert(
            "u@x.com".to_string(),
            InboxConfig {
                imap_host: "imap.example.com".to_string(),
                imap_port: 993,
                smtp_host: "smtp.example.com".to_string(),
                smtp_port: 587,
                user: "u@x.com".to_string(),
                secret: "hunter2".to_string(),
                auth,
                token_expires_at_ms,
            },
        );
        settings
    }

    #[test]
    fn test_resolve_unknown_inbox() {
        let resolver = CredentialResolver::new(&Settings::default());
        let err = resolver.resolve_imap("nobody@x.com").unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[test]
    fn test_resolve_password_inbox() {
        let resolver = CredentialResolver::new(&settings_with(AuthKindConfig::Password, None));
        let creds = resolver.resolve_imap("u@x.com").expect("creds");
        assert_eq!(creds.host, "imap.example.com");
        assert_eq!(creds.port, 993);
        assert_eq!(creds.auth_kind, AuthKind::Password);

        let smtp = resolver.resolve_smtp("u@x.com").expect("creds");
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 587);
    }

    #[test]
    fn test_expired_oauth_token_is_refused() {
        let past = Utc::now().timestamp_millis() - 1_000;
        let resolver =
            CredentialResolver::new(&settings_with(AuthKindConfig::OauthBearer, Some(past)));
        let err = resolver.resolve_imap("u@x.com").unwrap_err();
        assert!(matches!(err, ProxyError::CredentialExpired(_)));
    }

    #[test]
    fn test_live_oauth_token_resolves() {
        let future = Utc::now().timestamp_millis() + 3_600_000;
        let resolver =
            CredentialResolver::new(&settings_with(AuthKindConfig::OauthBearer, Some(future)));
        let creds = resolver.resolve_imap("u@x.com").expect("creds");
        assert_eq!(creds.auth_kind, AuthKind::OauthBearer);
        assert!(resolver.token_expiry("u@x.com").is_some());
    }
}
