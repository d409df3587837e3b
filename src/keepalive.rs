// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Keep-alive worker.
//!
//! Sweeps the session store on a fixed interval, refreshing TTLs before they
//! lapse and issuing protocol NOOPs through whichever pool holds the live
//! handle. Sessions owned by a different instance get TTL refresh only; the
//! owning instance's own sweep does the protocol half. Records that have gone
//! untouched past their TTL are retired; their handles die lazily at the next
//! checkout probe.
//!
//! All log events carry the inbox hash, never the raw id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Notify;

use crate::credentials::CredentialResolver;
use crate::pool::{imap::ImapPool, smtp::SmtpPool, KeepAliveProbe};
use crate::store::{Protocol, SessionStatus, SessionStore, StatField, TouchOutcome};

/// Warn and mark `status=refreshing` when an OAuth token is this close to
/// expiry. Rotation itself is out of scope.
const TOKEN_EXPIRY_WARNING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

pub struct KeepAliveWorker {
    store: Arc<dyn SessionStore>,
    imap: Arc<ImapPool>,
    smtp: Arc<SmtpPool>,
    resolver: Arc<CredentialResolver>,
    interval: Duration,
    /// Shutdown signal.
    shutdown: Arc<Notify>,
}

impl KeepAliveWorker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        imap: Arc<ImapPool>,
        smtp: Arc<SmtpPool>,
        resolver: Arc<CredentialResolver>,
        interval: Duration,
    ) -> Self {
        KeepAliveWorker {
            store,
            imap,
            smtp,
            resolver,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Sweep on a fixed interval until [`KeepAliveWorker::stop`] is called.
    /// A store outage skips the tick and retries at the next one.
    pub async fn run(&self) {
        info!("keepalive_started interval_s={}", self.interval.as_secs());
        loop {
            // Wait for interval or shutdown; ticking before any session
            // exists would just sweep an empty store.
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.notified() => {
                    info!("keepalive_stopped");
                    return;
                }
            }
            self.tick().await;
        }
    }

    /// Signal the run loop to exit after its current sweep.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// One sweep over both protocols.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        for proto in Protocol::ALL {
            let sessions = match self.store.scan_active(proto).await {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("store_unreachable proto={} op=scan err={}", proto, e);
                    continue;
                }
            };
            for (hash, record) in sessions {
                summary.total += 1;
                let now_ms = Utc::now().timestamp_millis();

                if record.is_expired(now_ms) {
                    if let Err(e) = self.store.mark_retired(proto, &hash).await {
                        warn!("store_unreachable proto={} op=retire err={}", proto, e);
                    }
                    info!("session_expired proto={} inbox={}", proto, hash);
                    summary.failed += 1;
                    continue;
                }

                self.check_token_expiry(proto, &hash).await;

                let ttl = Duration::from_secs(record.ttl_seconds.max(1));
                let due_after_ms =
                    (ttl.as_millis() as i64) - 2 * (self.interval.as_millis() as i64);
                if now_ms - record.last_refreshed_at < due_after_ms {
                    continue;
                }

                match self.probe(proto, &hash).await {
                    KeepAliveProbe::NoopOk => {
                        self.bump_stat(proto, &hash, StatField::NoopsOk).await;
                        if self.refresh(proto, &hash, ttl).await {
                            debug!("noop_sent proto={} inbox={} ttl_s={}", proto, hash, ttl.as_secs());
                            summary.success += 1;
                        } else {
                            summary.failed += 1;
                        }
                    }
                    KeepAliveProbe::Busy | KeepAliveProbe::NotHeld => {
                        // TTL refresh alone keeps the record visible; the
                        // owning instance's next tick does the protocol NOOP.
                        if self.refresh(proto, &hash, ttl).await {
                            summary.success += 1;
                        } else {
                            summary.failed += 1;
                        }
                    }
                    KeepAliveProbe::NoopFailed => {
                        self.bump_stat(proto, &hash, StatField::NoopsFail).await;
                        if let Err(e) = self.store.mark_retired(proto, &hash).await {
                            warn!("store_unreachable proto={} op=retire err={}", proto, e);
                        }
                        warn!("noop_failed proto={} inbox={}", proto, hash);
                        summary.failed += 1;
                    }
                }
            }
        }
        info!(
            "keepalive_tick total={} success={} failed={}",
            summary.total, summary.success, summary.failed
        );
        summary
    }

    async fn probe(&self, proto: Protocol, hash: &str) -> KeepAliveProbe {
        match proto {
            Protocol::Imap => self.imap.keepalive(hash).await,
            Protocol::Smtp => self.smtp.keepalive(hash).await,
        }
    }

    async fn refresh(&self, proto: Protocol, hash: &str, ttl: Duration) -> bool {
        match self.store.refresh(proto, hash, ttl).await {
            Ok(TouchOutcome::Touched) => true,
            Ok(TouchOutcome::Missing) => {
                // Store expiry won the race; the handle dies at next checkout.
                debug!("session_vanished proto={} inbox={}", proto, hash);
                false
            }
            Err(e) => {
                warn!("store_unreachable proto={} op=refresh err={}", proto, e);
                false
            }
        }
    }

    async fn bump_stat(&self, proto: Protocol, hash: &str, field: StatField) {
        if let Err(e) = self.store.incr_stat(proto, hash, field, 1).await {
            debug!(
                "stat_dropped proto={} inbox={} field={} err={}",
                proto,
                hash,
                field.as_str(),
                e
            );
        }
    }

    /// Flag sessions whose OAuth token is about to lapse. Only possible when
    /// this instance holds the handle and can map the hash back to an id.
    async fn check_token_expiry(&self, proto: Protocol, hash: &str) {
        let inbox_id = match proto {
            Protocol::Imap => self.imap.inbox_for_hash(hash),
            Protocol::Smtp => self.smtp.inbox_for_hash(hash),
        };
        let Some(inbox_id) = inbox_id else { return };
        let Some(expires_at) = self.resolver.token_expiry(&inbox_id) else {
            return;
        };
        let remaining = (expires_at - Utc::now()).num_seconds();
        if remaining < TOKEN_EXPIRY_WARNING.as_secs() as i64 {
            warn!(
                "token_expiring_soon proto={} inbox={} expires_in_s={}",
                proto, hash, remaining
            );
            if let Err(e) = self
                .store
                .set_status(proto, hash, SessionStatus::Refreshing)
                .await
            {
                warn!("store_unreachable proto={} op=set_status err={}", proto, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthKindConfig, Settings};
    use crate::ids::inbox_hash;
    use crate::pool::imap::tests::{pool_with, test_settings, MockImapState};
    use crate::pool::smtp::{SmtpConnection, SmtpConnector};
    use crate::pool::CheckinOutcome;
    use crate::store::{MemorySessionStore, SessionRecord, SessionStatus};
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    struct NoSmtpConnector;

    #[async_trait]
    impl SmtpConnector for NoSmtpConnector {
        async fn connect(
            &self,
            _creds: &crate::credentials::Credentials,
        ) -> Result<Box<dyn SmtpConnection>, crate::error::ProxyError> {
            Err(crate::error::ProxyError::UpstreamUnavailable(
                "no smtp in this test".into(),
            ))
        }
    }

    fn worker_with(
        settings: &Settings,
        store: Arc<MemorySessionStore>,
        imap_state: Arc<MockImapState>,
        interval: Duration,
    ) -> (KeepAliveWorker, Arc<ImapPool>) {
        let imap = Arc::new(pool_with(
            imap_state,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            settings,
        ));
        let smtp = Arc::new(SmtpPool::new(
            Arc::new(NoSmtpConnector),
            Arc::new(CredentialResolver::new(settings)),
            Arc::clone(&store) as Arc<dyn SessionStore>,
            settings,
            "test-instance",
        ));
        let worker = KeepAliveWorker::new(
            store,
            Arc::clone(&imap),
            smtp,
            Arc::new(CredentialResolver::new(settings)),
            interval,
        );
        (worker, imap)
    }

    #[tokio::test]
    async fn test_tick_refreshes_due_sessions() {
        let settings = test_settings();
        let store = Arc::new(MemorySessionStore::new());
        let hash = inbox_hash("u@x.com");

        // Due for refresh: last refreshed 260 s ago against a 300 s TTL and
        // a 25 s sweep interval, but recently used so not expired.
        let mut record = SessionRecord::new(&hash, Duration::from_secs(300), "other-instance");
        record.last_refreshed_at = Utc::now().timestamp_millis() - 260_000;
        store.put_new(Protocol::Imap, &record).await.unwrap();
        // Let some of the store TTL elapse conceptually: shrink it first.
        store
            .touch(Protocol::Imap, &hash, Duration::from_secs(30))
            .await
            .unwrap();

        let (worker, _imap) = worker_with(
            &settings,
            Arc::clone(&store),
            Arc::new(MockImapState::default()),
            Duration::from_secs(25),
        );
        let summary = worker.tick().await;
        assert_eq!(summary.total, 1);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 0);

        // TTL was reset to the record's own target.
        let ttl = store.ttl_remaining(Protocol::Imap, &hash).expect("ttl");
        assert!(ttl > Duration::from_secs(295));
    }

    #[tokio::test]
    async fn test_tick_sends_noop_through_owning_pool() {
        let settings = test_settings();
        let store = Arc::new(MemorySessionStore::new());
        let imap_state = Arc::new(MockImapState::default());
        // A sweep interval of half the TTL makes every session due at once.
        let (worker, imap) = worker_with(
            &settings,
            Arc::clone(&store),
            Arc::clone(&imap_state),
            Duration::from_secs(150),
        );

        let lease = imap.checkout("u@x.com").await.expect("checkout");
        imap.checkin(lease, CheckinOutcome::Success).await;
        let noops_before = imap_state.noops.load(Ordering::SeqCst);

        let summary = worker.tick().await;
        assert_eq!(summary.success, 1);
        assert_eq!(imap_state.noops.load(Ordering::SeqCst), noops_before + 1);

        let hash = inbox_hash("u@x.com");
        let record = store.get(Protocol::Imap, &hash).await.unwrap().unwrap();
        assert_eq!(record.stats.noops_ok, 1);
    }

    #[tokio::test]
    async fn test_noop_failure_retires_session() {
        let settings = test_settings();
        let store = Arc::new(MemorySessionStore::new());
        let imap_state = Arc::new(MockImapState::default());
        let (worker, imap) = worker_with(
            &settings,
            Arc::clone(&store),
            Arc::clone(&imap_state),
            Duration::from_secs(150),
        );

        let lease = imap.checkout("u@x.com").await.expect("checkout");
        imap.checkin(lease, CheckinOutcome::Success).await;
        imap_state.fail_next_noop.store(true, Ordering::SeqCst);

        let summary = worker.tick().await;
        assert_eq!(summary.failed, 1);

        let hash = inbox_hash("u@x.com");
        let record = store.get(Protocol::Imap, &hash).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Retired);
        assert_eq!(record.stats.noops_fail, 1);
    }

    #[tokio::test]
    async fn test_stale_active_record_is_retired() {
        let settings = test_settings();
        let store = Arc::new(MemorySessionStore::new());
        let hash = inbox_hash("u@x.com");

        let mut record = SessionRecord::new(&hash, Duration::from_secs(300), "other-instance");
        record.last_used_at = Utc::now().timestamp_millis() - 400_000;
        record.last_refreshed_at = record.last_used_at;
        store.put_new(Protocol::Imap, &record).await.unwrap();

        let (worker, _imap) = worker_with(
            &settings,
            Arc::clone(&store),
            Arc::new(MockImapState::default()),
            Duration::from_secs(25),
        );
        let summary = worker.tick().await;
        assert_eq!(summary.failed, 1);

        let record = store.get(Protocol::Imap, &hash).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Retired);
    }

    #[tokio::test]
    async fn test_stop_ends_run_loop() {
        let settings = test_settings();
        let store = Arc::new(MemorySessionStore::new());
        let (worker, _imap) = worker_with(
            &settings,
            store,
            Arc::new(MockImapState::default()),
            Duration::from_secs(3600),
        );
        let worker = Arc::new(worker);

        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        // A stop issued while the loop sleeps (or even before it first
        // awaits) must terminate it.
        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run should exit after stop")
            .expect("worker task");
    }

    #[tokio::test]
    async fn test_expiring_oauth_token_marks_refreshing() {
        let mut settings = test_settings();
        {
            let inbox = settings.inboxes.get_mut("u@x.com").unwrap();
            inbox.auth = AuthKindConfig::OauthBearer;
            inbox.token_expires_at_ms = Some(Utc::now().timestamp_millis() + 30_000);
        }
        let store = Arc::new(MemorySessionStore::new());
        let imap_state = Arc::new(MockImapState::default());
        let (worker, imap) = worker_with(
            &settings,
            Arc::clone(&store),
            imap_state,
            Duration::from_secs(25),
        );

        let lease = imap.checkout("u@x.com").await.expect("checkout");
        imap.checkin(lease, CheckinOutcome::Success).await;

        worker.tick().await;

        let hash = inbox_hash("u@x.com");
        let record = store.get(Protocol::Imap, &hash).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Refreshing);
    }
}
