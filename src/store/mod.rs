// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session metadata persistence.
//!
//! A typed wrapper over an external key/value store with Redis semantics:
//! string keys, hash values, per-key TTL, atomic counters and cursor SCAN.
//! Records describe logical mail sessions so that a restarted proxy instance
//! can find, refresh or retire sessions established by a previous one. The
//! store's TTL is the authoritative expiry; in-memory pool handles are only a
//! best-effort cache of what the store asserts is still alive.
//!
//! All operations are atomic with respect to a single session key. Nothing in
//! the core relies on multi-key transactions or distributed locks.

pub mod memory;
pub mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

pub use self::memory::MemorySessionStore;
pub use self::redis::RedisSessionStore;

/// Key under which cross-inbox aggregate counters live.
pub const GLOBAL_STATS_KEY: &str = "stats:global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Imap,
    Smtp,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Imap, Protocol::Smtp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Imap => "imap",
            Protocol::Smtp => "smtp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `session:{protocol}:{inbox_id_hash}`
pub fn session_key(proto: Protocol, inbox_id_hash: &str) -> String {
    format!("session:{}:{}", proto.as_str(), inbox_id_hash)
}

pub fn session_key_pattern(proto: Protocol) -> String {
    format!("session:{}:*", proto.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Active,
    Refreshing,
    Retired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Refreshing => "refreshing",
            SessionStatus::Retired => "retired",
        }
    }

    /// Unknown values parse as `Active`: a newer writer may know states this
    /// reader does not, and treating them as live is the safe direction.
    pub fn parse(s: &str) -> Self {
        match s {
            "retired" => SessionStatus::Retired,
            "refreshing" => SessionStatus::Refreshing,
            _ => SessionStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub hits: u64,
    pub misses: u64,
    pub noops_ok: u64,
    pub noops_fail: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    Hits,
    Misses,
    NoopsOk,
    NoopsFail,
}

impl StatField {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatField::Hits => "hits",
            StatField::Misses => "misses",
            StatField::NoopsOk => "noops_ok",
            StatField::NoopsFail => "noops_fail",
        }
    }
}

/// Persisted metadata for one logical mail session.
///
/// Serialized as a hash of fields with all numerics as decimal strings;
/// unknown fields are ignored on read so newer writers stay compatible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub inbox_id_hash: String,
    /// Unix ms.
    pub created_at: i64,
    pub last_used_at: i64,
    pub last_refreshed_at: i64,
    pub ttl_seconds: u64,
    pub status: SessionStatus,
    /// Best-effort id of the instance holding the live handle. Metadata only;
    /// ownership is not enforced by lock.
    pub owner_instance: String,
    pub stats: SessionStats,
}

impl SessionRecord {
    pub fn new(inbox_id_hash: &str, ttl: Duration, owner_instance: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        SessionRecord {
            inbox_id_hash: inbox_id_hash.to_string(),
            created_at: now,
            last_used_at: now,
            last_refreshed_at: now,
            ttl_seconds: ttl.as_secs(),
            status: SessionStatus::Active,
            owner_instance: owner_instance.to_string(),
            stats: SessionStats::default(),
        }
    }

    /// Whether the record has gone untouched past its own TTL. The store's
    /// key expiry normally fires first; this covers lagging stores.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        let age_ms = now_ms.saturating_sub(self.last_used_at.max(self.last_refreshed_at));
        age_ms > (self.ttl_seconds as i64).saturating_mul(1000)
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("inbox_id_hash".into(), self.inbox_id_hash.clone()),
            ("created_at".into(), self.created_at.to_string()),
            ("last_used_at".into(), self.last_used_at.to_string()),
            (
                "last_refreshed_at".into(),
                self.last_refreshed_at.to_string(),
            ),
            ("ttl_seconds".into(), self.ttl_seconds.to_string()),
            ("status".into(), self.status.as_str().to_string()),
            ("owner_instance".into(), self.owner_instance.clone()),
            ("hits".into(), self.stats.hits.to_string()),
            ("misses".into(), self.stats.misses.to_string()),
            ("noops_ok".into(), self.stats.noops_ok.to_string()),
            ("noops_fail".into(), self.stats.noops_fail.to_string()),
        ]
    }

    /// Rebuild a record from stored hash fields. Returns `None` for an empty
    /// or identity-less hash. Missing numerics default to zero; unrecognized
    /// fields are skipped.
    pub fn from_fields<'a, I>(fields: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut rec = SessionRecord {
            inbox_id_hash: String::new(),
            created_at: 0,
            last_used_at: 0,
            last_refreshed_at: 0,
            ttl_seconds: 0,
            status: SessionStatus::Active,
            owner_instance: String::new(),
            stats: SessionStats::default(),
        };
        for (name, value) in fields {
            match name {
                "inbox_id_hash" => rec.inbox_id_hash = value.to_string(),
                "created_at" => rec.created_at = value.parse().unwrap_or(0),
                "last_used_at" => rec.last_used_at = value.parse().unwrap_or(0),
                "last_refreshed_at" => rec.last_refreshed_at = value.parse().unwrap_or(0),
                "ttl_seconds" => rec.ttl_seconds = value.parse().unwrap_or(0),
                "status" => rec.status = SessionStatus::parse(value),
                "owner_instance" => rec.owner_instance = value.to_string(),
                "hits" => rec.stats.hits = value.parse().unwrap_or(0),
                "misses" => rec.stats.misses = value.parse().unwrap_or(0),
                "noops_ok" => rec.stats.noops_ok = value.parse().unwrap_or(0),
                "noops_fail" => rec.stats.noops_fail = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if rec.inbox_id_hash.is_empty() {
            None
        } else {
            Some(rec)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Touched,
    Missing,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out")]
    Timeout,
}

/// Contract over the shared session store.
///
/// Implementations must keep every operation atomic w.r.t. its single key.
/// Callers on request paths treat any `Err` as "store outage": they log,
/// drop the write, and keep serving from memory.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Create a record only if none exists; never overwrites.
    async fn put_new(
        &self,
        proto: Protocol,
        record: &SessionRecord,
    ) -> Result<PutOutcome, StoreError>;

    /// Reset key expiry and bump `last_used_at`.
    async fn touch(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        ttl: Duration,
    ) -> Result<TouchOutcome, StoreError>;

    /// Reset key expiry and bump `last_refreshed_at` (keep-alive path).
    async fn refresh(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        ttl: Duration,
    ) -> Result<TouchOutcome, StoreError>;

    async fn set_status(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        status: SessionStatus,
    ) -> Result<TouchOutcome, StoreError>;

    async fn mark_retired(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
    ) -> Result<TouchOutcome, StoreError> {
        self.set_status(proto, inbox_id_hash, SessionStatus::Retired)
            .await
    }

    /// Server-side atomic increment of a per-session counter. Callers never
    /// fail a request over this; a lost increment is logged and dropped.
    async fn incr_stat(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        field: StatField,
        delta: i64,
    ) -> Result<(), StoreError>;

    /// Atomic increment on the cross-inbox `stats:global` hash.
    async fn incr_global(&self, field: StatField, delta: i64) -> Result<(), StoreError>;

    async fn global_stats(&self) -> Result<SessionStats, StoreError>;

    /// Snapshot of all non-retired sessions for a protocol.
    ///
    /// Built on restartable cursor iteration: concurrent mutation may yield
    /// duplicates or skip entries added mid-scan, but the scan always
    /// terminates.
    async fn scan_active(
        &self,
        proto: Protocol,
    ) -> Result<Vec<(String, SessionRecord)>, StoreError>;

    /// Drop a record outright (explicit logout).
    async fn remove(&self, proto: Protocol, inbox_id_hash: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_field_round_trip() {
        let mut rec = SessionRecord::new("ab12cd34ef56", Duration::from_secs(300), "inst-1");
        rec.stats.hits = 7;
        rec.stats.noops_fail = 2;
        rec.status = SessionStatus::Refreshing;

        let fields = rec.to_fields();
        let parsed = SessionRecord::from_fields(
            fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .expect("record");
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let fields = [
            ("inbox_id_hash", "ab12cd34ef56"),
            ("ttl_seconds", "300"),
            ("status", "active"),
            ("shard_epoch", "9"),
            ("compression", "zstd"),
        ];
        let rec = SessionRecord::from_fields(fields).expect("record");
        assert_eq!(rec.ttl_seconds, 300);
        assert_eq!(rec.status, SessionStatus::Active);
    }

    #[test]
    fn test_unknown_status_reads_as_active() {
        assert_eq!(SessionStatus::parse("hibernating"), SessionStatus::Active);
    }

    #[test]
    fn test_identityless_hash_is_none() {
        assert!(SessionRecord::from_fields([("hits", "3")]).is_none());
        assert!(SessionRecord::from_fields(std::iter::empty()).is_none());
    }

    #[test]
    fn test_expiry_is_age_based() {
        let mut rec = SessionRecord::new("ab12cd34ef56", Duration::from_secs(1), "inst-1");
        let now = rec.last_used_at;
        assert!(!rec.is_expired(now + 500));
        assert!(rec.is_expired(now + 1_500));
        // A refresh keeps the record alive even if last_used_at lags.
        rec.last_refreshed_at = now + 2_000;
        assert!(!rec.is_expired(now + 2_500));
    }

    #[test]
    fn test_session_key_layout() {
        assert_eq!(
            session_key(Protocol::Imap, "ab12cd34ef56"),
            "session:imap:ab12cd34ef56"
        );
        assert_eq!(session_key_pattern(Protocol::Smtp), "session:smtp:*");
    }
}
