// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-process session store.
//!
//! The degenerate "store absent" deployment: same contract as the Redis
//! store, but records live in a process-local map and die with it. Also the
//! backing store for the test suite, which is why it exposes
//! [`MemorySessionStore::ttl_remaining`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    session_key, Protocol, PutOutcome, SessionRecord, SessionStats, SessionStatus, SessionStore,
    StatField, StoreError, TouchOutcome,
};

struct Entry {
    record: SessionRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Entry>,
    global: SessionStats,
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of a session key, if present and unexpired.
    pub fn ttl_remaining(&self, proto: Protocol, inbox_id_hash: &str) -> Option<Duration> {
        let key = session_key(proto, inbox_id_hash);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.sessions.get(&key)?;
        entry.expires_at.checked_duration_since(Instant::now())
    }

    fn with_live_entry<T>(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Result<Option<T>, StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge(&mut inner);
        Ok(inner.sessions.get_mut(&key).map(f))
    }

    fn purge(inner: &mut Inner) {
        let now = Instant::now();
        inner.sessions.retain(|_, entry| entry.expires_at > now);
    }

    fn stat_slot(stats: &mut SessionStats, field: StatField) -> &mut u64 {
        match field {
            StatField::Hits => &mut stats.hits,
            StatField::Misses => &mut stats.misses,
            StatField::NoopsOk => &mut stats.noops_ok,
            StatField::NoopsFail => &mut stats.noops_fail,
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.with_live_entry(proto, inbox_id_hash, |entry| entry.record.clone())
    }

    async fn put_new(
        &self,
        proto: Protocol,
        record: &SessionRecord,
    ) -> Result<PutOutcome, StoreError> {
        let key = session_key(proto, &record.inbox_id_hash);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge(&mut inner);
        if inner.sessions.contains_key(&key) {
            return Ok(PutOutcome::AlreadyExists);
        }
        inner.sessions.insert(
            key,
            Entry {
                record: record.clone(),
                expires_at: Instant::now() + Duration::from_secs(record.ttl_seconds),
            },
        );
        Ok(PutOutcome::Created)
    }

    async fn touch(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        ttl: Duration,
    ) -> Result<TouchOutcome, StoreError> {
        let touched = self.with_live_entry(proto, inbox_id_hash, |entry| {
            entry.expires_at = Instant::now() + ttl;
            entry.record.last_used_at = Utc::now().timestamp_millis();
        })?;
        Ok(match touched {
            Some(()) => TouchOutcome::Touched,
            None => TouchOutcome::Missing,
        })
    }

    async fn refresh(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        ttl: Duration,
    ) -> Result<TouchOutcome, StoreError> {
        let touched = self.with_live_entry(proto, inbox_id_hash, |entry| {
            entry.expires_at = Instant::now() + ttl;
            entry.record.last_refreshed_at = Utc::now().timestamp_millis();
        })?;
        Ok(match touched {
            Some(()) => TouchOutcome::Touched,
            None => TouchOutcome::Missing,
        })
    }

    async fn set_status(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        status: SessionStatus,
    ) -> Result<TouchOutcome, StoreError> {
        let updated = self.with_live_entry(proto, inbox_id_hash, |entry| {
            entry.record.status = status;
        })?;
        Ok(match updated {
            Some(()) => TouchOutcome::Touched,
            None => TouchOutcome::Missing,
        })
    }

    async fn incr_stat(
        &self,
        proto: Protocol,
        inbox_id_hash: &str,
        field: StatField,
        delta: i64,
    ) -> Result<(), StoreError> {
        self.with_live_entry(proto, inbox_id_hash, |entry| {
            let slot = Self::stat_slot(&mut entry.record.stats, field);
            *slot = slot.saturating_add_signed(delta);
        })?;
        Ok(())
    }

    async fn incr_global(&self, field: StatField, delta: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = Self::stat_slot(&mut inner.global, field);
        *slot = slot.saturating_add_signed(delta);
        Ok(())
    }

    async fn global_stats(&self) -> Result<SessionStats, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.global)
    }

    async fn scan_active(
        &self,
        proto: Protocol,
    ) -> Result<Vec<(String, SessionRecord)>, StoreError> {
        let prefix = session_key(proto, "");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge(&mut inner);
        Ok(inner
            .sessions
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(&prefix) && entry.record.status != SessionStatus::Retired
            })
            .map(|(key, entry)| {
                (
                    key.strip_prefix(&prefix).unwrap_or(key).to_string(),
                    entry.record.clone(),
                )
            })
            .collect())
    }

    async fn remove(&self, proto: Protocol, inbox_id_hash: &str) -> Result<(), StoreError> {
        let key = session_key(proto, inbox_id_hash);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_new_is_create_once() {
        let store = MemorySessionStore::new();
        let rec = SessionRecord::new("ab12cd34ef56", Duration::from_secs(300), "inst-1");
        assert_eq!(
            store.put_new(Protocol::Imap, &rec).await.unwrap(),
            PutOutcome::Created
        );
        assert_eq!(
            store.put_new(Protocol::Imap, &rec).await.unwrap(),
            PutOutcome::AlreadyExists
        );
        // Same hash, different protocol: independent key.
        assert_eq!(
            store.put_new(Protocol::Smtp, &rec).await.unwrap(),
            PutOutcome::Created
        );
    }

    #[tokio::test]
    async fn test_touch_resets_expiry() {
        let store = MemorySessionStore::new();
        let rec = SessionRecord::new("ab12cd34ef56", Duration::from_secs(10), "inst-1");
        store.put_new(Protocol::Imap, &rec).await.unwrap();

        assert_eq!(
            store
                .touch(Protocol::Imap, "ab12cd34ef56", Duration::from_secs(300))
                .await
                .unwrap(),
            TouchOutcome::Touched
        );
        let ttl = store
            .ttl_remaining(Protocol::Imap, "ab12cd34ef56")
            .expect("ttl");
        assert!(ttl > Duration::from_secs(290));
    }

    #[tokio::test]
    async fn test_touch_missing() {
        let store = MemorySessionStore::new();
        assert_eq!(
            store
                .touch(Protocol::Imap, "0000deadbeef", Duration::from_secs(300))
                .await
                .unwrap(),
            TouchOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_scan_active_skips_retired() {
        let store = MemorySessionStore::new();
        let a = SessionRecord::new("aaaaaaaaaaaa", Duration::from_secs(300), "inst-1");
        let b = SessionRecord::new("bbbbbbbbbbbb", Duration::from_secs(300), "inst-1");
        store.put_new(Protocol::Imap, &a).await.unwrap();
        store.put_new(Protocol::Imap, &b).await.unwrap();
        store
            .mark_retired(Protocol::Imap, "bbbbbbbbbbbb")
            .await
            .unwrap();

        let active = store.scan_active(Protocol::Imap).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, "aaaaaaaaaaaa");
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let store = MemorySessionStore::new();
        let rec = SessionRecord::new("ab12cd34ef56", Duration::from_secs(300), "inst-1");
        store.put_new(Protocol::Imap, &rec).await.unwrap();
        store
            .incr_stat(Protocol::Imap, "ab12cd34ef56", StatField::Hits, 1)
            .await
            .unwrap();
        store
            .incr_stat(Protocol::Imap, "ab12cd34ef56", StatField::Hits, 2)
            .await
            .unwrap();
        let rec = store
            .get(Protocol::Imap, "ab12cd34ef56")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.stats.hits, 3);

        store.incr_global(StatField::Misses, 1).await.unwrap();
        assert_eq!(store.global_stats().await.unwrap().misses, 1);
    }
}
