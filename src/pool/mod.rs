// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Connection pooling shared by the IMAP and SMTP sides.
//!
//! Both pools follow the same shape: live protocol handles keyed by inbox id,
//! handed out one at a time per id, with session metadata mirrored into the
//! shared store. This module holds the pieces that are protocol-agnostic:
//! the per-id slot map (exclusivity + LRU bound), the store ledger (all
//! best-effort writes on the request path), and deadline plumbing.
//!
//! A handle moves `Building -> Idle <-> InUse -> Closing -> Gone`. "InUse" is
//! a locked slot; "Closing" is `conn.take()` followed by a best-effort
//! logout; nothing transitions out of Closing.

pub mod imap;
pub mod smtp;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

use crate::error::ProxyError;
use crate::store::{
    Protocol, SessionRecord, SessionStatus, SessionStore, StatField, TouchOutcome,
};

/// How a checkout was satisfied: `Hit` reused an already-open healthy handle,
/// `Miss` built a new one (cold start or failed probe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutKind {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    Success,
    Failed,
}

/// Result of a keep-alive probe against a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveProbe {
    /// Live handle answered NOOP.
    NoopOk,
    /// Live handle failed NOOP and was closed.
    NoopFailed,
    /// Handle exists but is checked out right now; in use means alive.
    Busy,
    /// This instance holds no handle for the inbox.
    NotHeld,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub live: u64,
}

/// Run `fut` under `deadline`; a breach surfaces as `DeadlineExceeded` and the
/// caller is expected to close whatever handle was mid-command.
pub(crate) async fn with_deadline<T, F>(
    deadline: Duration,
    what: &'static str,
    fut: F,
) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::DeadlineExceeded(what)),
    }
}

/// One pooled entry. Lives behind a fair async mutex; holding the lock *is*
/// the checkout.
pub(crate) struct Slot<C> {
    pub conn: Option<C>,
    pub last_used: Instant,
    pub hits: u64,
    pub misses: u64,
}

impl<C> Slot<C> {
    fn new() -> Self {
        Slot {
            conn: None,
            last_used: Instant::now(),
            hits: 0,
            misses: 0,
        }
    }
}

pub(crate) type SlotGuard<C> = OwnedMutexGuard<Slot<C>>;
type SlotHandle<C> = Arc<TokioMutex<Slot<C>>>;

/// Per-inbox slot registry.
///
/// The outer lock guards only map shape and is never held across I/O; the
/// per-slot `tokio::sync::Mutex` provides the per-id exclusivity contract and
/// queues waiters in FIFO order, which is what keeps concurrent checkouts for
/// one id starvation-free.
pub(crate) struct SlotMap<C> {
    max_live: usize,
    slots: Mutex<HashMap<String, SlotHandle<C>>>,
    // inbox hash -> inbox id, so the keep-alive worker can reach live slots
    // without ever learning raw ids from the store.
    hashes: Mutex<HashMap<String, String>>,
}

impl<C> SlotMap<C> {
    pub fn new(max_live: usize) -> Self {
        SlotMap {
            max_live: max_live.max(1),
            slots: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the slot for an inbox id. When creating would exceed the
    /// live bound, the least-recently-used idle slot is evicted and returned
    /// so the pool can close its connection gracefully.
    pub fn slot_for(
        &self,
        inbox_id: &str,
        inbox_id_hash: &str,
    ) -> (SlotHandle<C>, Option<SlotHandle<C>>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slots.get(inbox_id) {
            return (Arc::clone(existing), None);
        }

        let mut evicted = None;
        if slots.len() >= self.max_live {
            // Only idle slots are candidates; a locked slot is in use.
            let victim = slots
                .iter()
                .filter_map(|(id, handle)| {
                    let guard = handle.try_lock().ok()?;
                    Some((id.clone(), guard.last_used))
                })
                .min_by_key(|(_, last_used)| *last_used)
                .map(|(id, _)| id);
            if let Some(victim_id) = victim {
                evicted = slots.remove(&victim_id);
            }
        }

        let handle: SlotHandle<C> = Arc::new(TokioMutex::new(Slot::new()));
        slots.insert(inbox_id.to_string(), Arc::clone(&handle));
        drop(slots);

        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        hashes.insert(inbox_id_hash.to_string(), inbox_id.to_string());

        (handle, evicted)
    }

    pub fn existing(&self, inbox_id: &str) -> Option<SlotHandle<C>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(inbox_id).cloned()
    }

    pub fn inbox_for_hash(&self, inbox_id_hash: &str) -> Option<String> {
        let hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        hashes.get(inbox_id_hash).cloned()
    }

    pub fn remove(&self, inbox_id: &str, inbox_id_hash: &str) -> Option<SlotHandle<C>> {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        hashes.remove(inbox_id_hash);
        drop(hashes);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(inbox_id)
    }

    pub fn drain(&self) -> Vec<SlotHandle<C>> {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        hashes.clear();
        drop(hashes);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.drain().map(|(_, handle)| handle).collect()
    }

    /// Count of slots currently holding an open connection. A locked slot is
    /// checked out and counted as live.
    pub fn live_count(&self) -> u64 {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|handle| match handle.try_lock() {
                Ok(guard) => guard.conn.is_some(),
                Err(_) => true,
            })
            .count() as u64
    }

    /// In-memory hit/miss counters for one inbox; the fallback when the
    /// session store cannot be reached.
    pub async fn memory_stats(&self, inbox_id: &str) -> (u64, u64) {
        let handle = match self.existing(inbox_id) {
            Some(handle) => handle,
            None => return (0, 0),
        };
        let guard = handle.lock().await;
        (guard.hits, guard.misses)
    }
}

/// Best-effort mirror of pool activity into the session store.
///
/// Nothing here ever fails a request: every error degrades to a log line and
/// the pool keeps serving from memory.
pub(crate) struct SessionLedger {
    store: Arc<dyn SessionStore>,
    proto: Protocol,
    ttl: Duration,
    instance_id: String,
}

/// What the store asserts about a session at checkout time.
pub(crate) enum StoreView {
    /// Record present and not retired: the in-memory handle may be reused.
    Live,
    /// Record missing, expired or retired: any in-memory handle is stale.
    Gone,
    /// Store unreachable: memory is all we have, proceed with it.
    Unreachable,
}

impl SessionLedger {
    pub fn new(
        store: Arc<dyn SessionStore>,
        proto: Protocol,
        ttl: Duration,
        instance_id: String,
    ) -> Self {
        SessionLedger {
            store,
            proto,
            ttl,
            instance_id,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn view(&self, inbox_id_hash: &str) -> StoreView {
        match self.store.get(self.proto, inbox_id_hash).await {
            Ok(Some(rec)) if rec.status != SessionStatus::Retired => StoreView::Live,
            Ok(_) => StoreView::Gone,
            Err(e) => {
                debug!(
                    "store_unreachable proto={} inbox={} op=get err={}",
                    self.proto, inbox_id_hash, e
                );
                StoreView::Unreachable
            }
        }
    }

    /// Record a completed checkout: refresh the session record (creating it
    /// on first login) and bump the per-session and global counters.
    pub async fn note_checkout(&self, inbox_id_hash: &str, kind: CheckoutKind) {
        match self.store.touch(self.proto, inbox_id_hash, self.ttl).await {
            Ok(TouchOutcome::Touched) => {}
            Ok(TouchOutcome::Missing) => {
                let record = SessionRecord::new(inbox_id_hash, self.ttl, &self.instance_id);
                if let Err(e) = self.store.put_new(self.proto, &record).await {
                    debug!(
                        "store_unreachable proto={} inbox={} op=put_new err={}",
                        self.proto, inbox_id_hash, e
                    );
                } else {
                    debug!(
                        "session_created proto={} inbox={} ttl_s={}",
                        self.proto,
                        inbox_id_hash,
                        self.ttl.as_secs()
                    );
                }
            }
            Err(e) => {
                debug!(
                    "store_unreachable proto={} inbox={} op=touch err={}",
                    self.proto, inbox_id_hash, e
                );
            }
        }

        let field = match kind {
            CheckoutKind::Hit => StatField::Hits,
            CheckoutKind::Miss => StatField::Misses,
        };
        if let Err(e) = self.store.incr_stat(self.proto, inbox_id_hash, field, 1).await {
            debug!(
                "stat_dropped proto={} inbox={} field={} err={}",
                self.proto,
                inbox_id_hash,
                field.as_str(),
                e
            );
        }
        if let Err(e) = self.store.incr_global(field, 1).await {
            debug!("stat_dropped key=global field={} err={}", field.as_str(), e);
        }
    }

    pub async fn note_removed(&self, inbox_id_hash: &str) {
        if let Err(e) = self.store.remove(self.proto, inbox_id_hash).await {
            debug!(
                "store_unreachable proto={} inbox={} op=remove err={}",
                self.proto, inbox_id_hash, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slot_map_reuses_slots() {
        let map: SlotMap<u32> = SlotMap::new(8);
        let (a, _) = map.slot_for("u@x.com", "aaaaaaaaaaaa");
        let (b, _) = map.slot_for("u@x.com", "aaaaaaaaaaaa");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.inbox_for_hash("aaaaaaaaaaaa").as_deref(), Some("u@x.com"));
    }

    #[tokio::test]
    async fn test_slot_map_evicts_lru_idle() {
        let map: SlotMap<u32> = SlotMap::new(2);
        let (a, _) = map.slot_for("a@x.com", "aaaaaaaaaaaa");
        {
            let mut guard = a.lock().await;
            guard.conn = Some(1);
            guard.last_used = Instant::now() - Duration::from_secs(120);
        }
        let (_b, none) = map.slot_for("b@x.com", "bbbbbbbbbbbb");
        assert!(none.is_none());

        // Third inbox exceeds the bound; the stale "a" slot is handed back.
        let (_c, evicted) = map.slot_for("c@x.com", "cccccccccccc");
        let evicted = evicted.expect("an idle slot should be evicted");
        assert!(Arc::ptr_eq(&evicted, &a));
        assert!(map.existing("a@x.com").is_none());
    }

    #[tokio::test]
    async fn test_slot_map_never_evicts_checked_out_slot() {
        let map: SlotMap<u32> = SlotMap::new(1);
        let (a, _) = map.slot_for("a@x.com", "aaaaaaaaaaaa");
        let _held = a.clone().lock_owned().await;
        let (_b, evicted) = map.slot_for("b@x.com", "bbbbbbbbbbbb");
        assert!(evicted.is_none());
        // The held slot survives even over the bound.
        assert!(map.existing("a@x.com").is_some());
    }

    #[tokio::test]
    async fn test_live_count_counts_open_and_checked_out() {
        let map: SlotMap<u32> = SlotMap::new(8);
        let (a, _) = map.slot_for("a@x.com", "aaaaaaaaaaaa");
        a.lock().await.conn = Some(1);
        let (b, _) = map.slot_for("b@x.com", "bbbbbbbbbbbb");
        assert_eq!(map.live_count(), 1);
        let _held = b.clone().lock_owned().await;
        assert_eq!(map.live_count(), 2);
    }

    #[tokio::test]
    async fn test_deadline_wrapper() {
        let ok = with_deadline(Duration::from_secs(1), "noop", async { Ok::<_, ProxyError>(7) })
            .await
            .unwrap();
        assert_eq!(ok, 7);

        let err = with_deadline(Duration::from_millis(10), "fetch", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ProxyError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::DeadlineExceeded("fetch")));
    }
}
