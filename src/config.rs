// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Application settings.
//!
//! Loaded from a TOML file layered with `MAILBRIDGE__`-prefixed environment
//! variables, e.g. `MAILBRIDGE__STORE_URL` or `MAILBRIDGE__LOG__LEVEL`.
//! Every tunable has a serde default so a minimal file (or none at all) is
//! enough to boot a memory-only instance.

use std::collections::HashMap;
use std::time::Duration;

use config::{Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

/// Upstream account wiring for one inbox id. The map key in
/// `Settings::inboxes` is the opaque inbox id itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub user: String,
    pub secret: String,
    #[serde(default)]
    pub auth: AuthKindConfig,
    /// Unix-ms expiry of the OAuth access token, when `auth = "oauth_bearer"`.
    #[serde(default)]
    pub token_expires_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthKindConfig {
    #[default]
    Password,
    OauthBearer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_body_char_limit")]
    pub body_char_limit: usize,
    #[serde(default = "default_attachment_char_limit")]
    pub attachment_char_limit: usize,
    /// Substring patterns matched (case-insensitive) against image `src`
    /// attributes; matching images are stripped as trackers.
    #[serde(default)]
    pub tracking_host_patterns: Vec<String>,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        TransformerConfig {
            body_char_limit: default_body_char_limit(),
            attachment_char_limit: default_attachment_char_limit(),
            tracking_host_patterns: Vec::new(),
        }
    }
}

/// Per-operation deadlines, in seconds. Applied around every external
/// round-trip; a breach closes the affected handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_imap_op_seconds")]
    pub imap_op_seconds: u64,
    #[serde(default = "default_smtp_op_seconds")]
    pub smtp_op_seconds: u64,
    #[serde(default = "default_store_op_seconds")]
    pub store_op_seconds: u64,
    #[serde(default = "default_extractor_seconds")]
    pub extractor_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            imap_op_seconds: default_imap_op_seconds(),
            smtp_op_seconds: default_smtp_op_seconds(),
            store_op_seconds: default_store_op_seconds(),
            extractor_seconds: default_extractor_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogConfig,

    /// Session store address (`redis://...`). Absent means memory-only
    /// operation: pools still work, sessions just do not survive restarts.
    #[serde(default)]
    pub store_url: Option<String>,

    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: u64,
    #[serde(default = "default_keepalive_interval_seconds")]
    pub keepalive_interval_seconds: u64,
    #[serde(default = "default_max_live_handles")]
    pub max_live_handles_per_protocol: usize,
    #[serde(default = "default_idle_probe_threshold_seconds")]
    pub idle_probe_threshold_seconds: u64,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub transformer: TransformerConfig,

    /// inbox id -> upstream account wiring.
    #[serde(default)]
    pub inboxes: HashMap<String, InboxConfig>,
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let default_config_path = "./config/default.toml";
        let (path, required) = match config_path {
            Some(p) => (p, true),
            None => (default_config_path, false),
        };

        let builder = config::Config::builder()
            .add_source(File::with_name(path).required(required))
            .add_source(Environment::with_prefix("MAILBRIDGE").separator("__"));

        builder.build()?.try_deserialize()
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_seconds)
    }

    pub fn idle_probe_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_probe_threshold_seconds)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log: LogConfig::default(),
            store_url: None,
            session_ttl_seconds: default_session_ttl_seconds(),
            keepalive_interval_seconds: default_keepalive_interval_seconds(),
            max_live_handles_per_protocol: default_max_live_handles(),
            idle_probe_threshold_seconds: default_idle_probe_threshold_seconds(),
            timeouts: TimeoutConfig::default(),
            transformer: TransformerConfig::default(),
            inboxes: HashMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_session_ttl_seconds() -> u64 {
    300
}

fn default_keepalive_interval_seconds() -> u64 {
    25
}

fn default_max_live_handles() -> usize {
    512
}

fn default_idle_probe_threshold_seconds() -> u64 {
    60
}

fn default_body_char_limit() -> usize {
    5000
}

fn default_attachment_char_limit() -> usize {
    2000
}

fn default_imap_op_seconds() -> u64 {
    15
}

fn default_smtp_op_seconds() -> u64 {
    30
}

fn default_store_op_seconds() -> u64 {
    2
}

fn default_extractor_seconds() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.session_ttl_seconds, 300);
        assert_eq!(s.keepalive_interval_seconds, 25);
        assert_eq!(s.max_live_handles_per_protocol, 512);
        assert_eq!(s.idle_probe_threshold_seconds, 60);
        assert_eq!(s.transformer.body_char_limit, 5000);
        assert_eq!(s.transformer.attachment_char_limit, 2000);
        assert!(s.transformer.tracking_host_patterns.is_empty());
        assert!(s.store_url.is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("MAILBRIDGE__SESSION_TTL_SECONDS", "120");
        std::env::set_var("MAILBRIDGE__STORE_URL", "redis://127.0.0.1:6379/1");
        let s = Settings::new(None).expect("settings");
        assert_eq!(s.session_ttl_seconds, 120);
        assert_eq!(s.store_url.as_deref(), Some("redis://127.0.0.1:6379/1"));
        std::env::remove_var("MAILBRIDGE__SESSION_TTL_SECONDS");
        std::env::remove_var("MAILBRIDGE__STORE_URL");
    }

    #[test]
    #[serial]
    fn test_minimal_config_boots_with_defaults() {
        let s = Settings::new(None).expect("settings");
        assert_eq!(s.session_ttl_seconds, 300);
        assert!(s.inboxes.is_empty());
    }
}
