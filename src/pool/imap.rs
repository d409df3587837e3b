// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP connection pool.
//!
//! Live IMAP sessions keyed by inbox id, checked out one at a time per id.
//! IMAP is a stateful protocol (selected mailbox, tag numbering), so a handle
//! is never visible to two callers at once; different inbox ids proceed in
//! parallel. A fresh handle costs a TCP + TLS + LOGIN + SELECT round-trip,
//! which is exactly what the pool exists to amortise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use log::{debug, info, warn};
use tokio::net::TcpStream;

use crate::config::Settings;
use crate::credentials::{AuthKind, CredentialResolver, Credentials};
use crate::error::ProxyError;
use crate::ids::inbox_hash;
use crate::pool::{
    with_deadline, CheckinOutcome, CheckoutKind, KeepAliveProbe, PoolStatsSnapshot, SessionLedger,
    SlotGuard, SlotMap, StoreView,
};
use crate::store::{Protocol, SessionStore};

/// One authenticated IMAP session with INBOX selected.
#[async_trait]
pub trait ImapConnection: Send {
    async fn noop(&mut self) -> Result<(), ProxyError>;

    /// `UID SEARCH ALL` over the selected mailbox, ascending.
    async fn uid_search_all(&mut self) -> Result<Vec<u32>, ProxyError>;

    /// `UID FETCH <uid> (BODY.PEEK[])`: raw RFC 5322 bytes without setting
    /// `\Seen`.
    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ProxyError>;

    async fn logout(&mut self) -> Result<(), ProxyError>;
}

/// Builds authenticated connections. The seam the tests mock out.
#[async_trait]
pub trait ImapConnector: Send + Sync {
    async fn connect(&self, creds: &Credentials) -> Result<Box<dyn ImapConnection>, ProxyError>;
}

type TlsSessionStream = tokio_native_tls::TlsStream<TcpStream>;

/// SASL XOAUTH2 initial response for `AUTHENTICATE XOAUTH2`:
/// `user=<inbox user>\x01auth=Bearer <access token>\x01\x01`.
///
/// async-imap base64-encodes whatever `process` returns before it goes on
/// the wire, so the bearer line is kept raw here.
struct XOAuth2Response(String);

impl XOAuth2Response {
    fn for_credentials(creds: &Credentials) -> Self {
        Self(format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            creds.user, creds.secret
        ))
    }
}

impl async_imap::Authenticator for XOAuth2Response {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.0.clone()
    }
}

/// Production connector: implicit TLS, LOGIN or `AUTHENTICATE XOAUTH2`,
/// `SELECT INBOX`.
pub struct TlsImapConnector {
    tls: tokio_native_tls::TlsConnector,
}

impl TlsImapConnector {
    pub fn new() -> Result<Self, ProxyError> {
        let tls = native_tls::TlsConnector::new()?;
        Ok(Self {
            tls: tokio_native_tls::TlsConnector::from(tls),
        })
    }
}

#[async_trait]
impl ImapConnector for TlsImapConnector {
    async fn connect(&self, creds: &Credentials) -> Result<Box<dyn ImapConnection>, ProxyError> {
        let tcp = TcpStream::connect((creds.host.as_str(), creds.port)).await?;
        let tls_stream = self.tls.connect(&creds.host, tcp).await?;
        let client = async_imap::Client::new(tls_stream);

        let mut session = match creds.auth_kind {
            AuthKind::Password => client
                .login(&creds.user, &creds.secret)
                .await
                .map_err(|(e, _client)| login_error(e))?,
            AuthKind::OauthBearer => client
                .authenticate("XOAUTH2", XOAuth2Response::for_credentials(creds))
                .await
                .map_err(|(e, _client)| login_error(e))?,
        };
        session.select("INBOX").await?;
        Ok(Box::new(TlsImapConnection { session }))
    }
}

/// A NO during LOGIN/AUTHENTICATE is a credential rejection, not a protocol
/// fault, and must not be retried within the request.
fn login_error(err: async_imap::error::Error) -> ProxyError {
    match err {
        async_imap::error::Error::No(msg) => ProxyError::UpstreamAuthFailed(msg),
        other => other.into(),
    }
}

struct TlsImapConnection {
    session: async_imap::Session<TlsSessionStream>,
}

#[async_trait]
impl ImapConnection for TlsImapConnection {
    async fn noop(&mut self) -> Result<(), ProxyError> {
        self.session.noop().await.map_err(Into::into)
    }

    async fn uid_search_all(&mut self) -> Result<Vec<u32>, ProxyError> {
        let uids = self.session.uid_search("ALL").await?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ProxyError> {
        let mut stream = self
            .session
            .uid_fetch(uid.to_string(), "(BODY.PEEK[])")
            .await?;
        let mut body = None;
        while let Some(fetch) = stream.try_next().await? {
            if let Some(bytes) = fetch.body() {
                body = Some(bytes.to_vec());
            }
        }
        body.ok_or_else(|| {
            ProxyError::UpstreamProtocolError(format!("no body returned for uid {}", uid))
        })
    }

    async fn logout(&mut self) -> Result<(), ProxyError> {
        self.session.logout().await.map_err(Into::into)
    }
}

/// Exclusive lease on one inbox's IMAP handle. Dropping the lease (or calling
/// [`ImapPool::checkin`]) releases the per-id lock; the connection stays
/// pooled unless an operation closed it.
pub struct ImapLease {
    guard: SlotGuard<Box<dyn ImapConnection>>,
    inbox_id_hash: String,
    kind: CheckoutKind,
    op_timeout: Duration,
}

impl std::fmt::Debug for ImapLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapLease")
            .field("inbox_id_hash", &self.inbox_id_hash)
            .field("kind", &self.kind)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl ImapLease {
    /// Whether this checkout reused a warm handle or built a fresh one.
    pub fn kind(&self) -> CheckoutKind {
        self.kind
    }

    pub fn inbox_id_hash(&self) -> &str {
        &self.inbox_id_hash
    }

    pub async fn uid_search_all(&mut self) -> Result<Vec<u32>, ProxyError> {
        let result = match self.guard.conn.as_mut() {
            Some(conn) => with_deadline(self.op_timeout, "imap search", conn.uid_search_all()).await,
            None => Err(closed()),
        };
        self.close_on_failure(result)
    }

    pub async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ProxyError> {
        let result = match self.guard.conn.as_mut() {
            Some(conn) => with_deadline(self.op_timeout, "imap fetch", conn.fetch_raw(uid)).await,
            None => Err(closed()),
        };
        self.close_on_failure(result)
    }

    pub async fn noop(&mut self) -> Result<(), ProxyError> {
        let result = match self.guard.conn.as_mut() {
            Some(conn) => with_deadline(self.op_timeout, "imap noop", conn.noop()).await,
            None => Err(closed()),
        };
        self.close_on_failure(result)
    }

    /// A failed or abandoned command leaves the connection in an unknown
    /// tagged state; drop it so the next checkout rebuilds.
    fn close_on_failure<T>(&mut self, result: Result<T, ProxyError>) -> Result<T, ProxyError> {
        if let Err(err) = &result {
            if matches!(
                err,
                ProxyError::UpstreamProtocolError(_)
                    | ProxyError::UpstreamUnavailable(_)
                    | ProxyError::DeadlineExceeded(_)
            ) {
                if self.guard.conn.take().is_some() {
                    debug!(
                        "handle_closed proto=imap inbox={} reason={}",
                        self.inbox_id_hash, err
                    );
                }
            }
        }
        result
    }
}

fn closed() -> ProxyError {
    ProxyError::UpstreamUnavailable("handle already closed".to_string())
}

pub struct ImapPool {
    connector: Arc<dyn ImapConnector>,
    resolver: Arc<CredentialResolver>,
    ledger: SessionLedger,
    slots: SlotMap<Box<dyn ImapConnection>>,
    idle_probe_threshold: Duration,
    op_timeout: Duration,
}

impl ImapPool {
    pub fn new(
        connector: Arc<dyn ImapConnector>,
        resolver: Arc<CredentialResolver>,
        store: Arc<dyn SessionStore>,
        settings: &Settings,
        instance_id: &str,
    ) -> Self {
        ImapPool {
            connector,
            resolver,
            ledger: SessionLedger::new(
                store,
                Protocol::Imap,
                settings.session_ttl(),
                instance_id.to_string(),
            ),
            slots: SlotMap::new(settings.max_live_handles_per_protocol),
            idle_probe_threshold: settings.idle_probe_threshold(),
            op_timeout: Duration::from_secs(settings.timeouts.imap_op_seconds),
        }
    }

    /// Acquire the single handle for `inbox_id`, building one on first use.
    ///
    /// Concurrent checkouts for the same id queue FIFO on the slot lock;
    /// different ids proceed in parallel. The store is consulted first: a
    /// missing or retired session record invalidates whatever handle memory
    /// still holds.
    pub async fn checkout(&self, inbox_id: &str) -> Result<ImapLease, ProxyError> {
        let hash = inbox_hash(inbox_id);
        let (slot, evicted) = self.slots.slot_for(inbox_id, &hash);
        if let Some(victim) = evicted {
            spawn_close(victim);
        }

        let mut guard = slot.lock_owned().await;

        if guard.conn.is_some() {
            if let StoreView::Gone = self.ledger.view(&hash).await {
                guard.conn = None;
                debug!("handle_closed proto=imap inbox={} reason=session_gone", hash);
            }
        }

        if guard.conn.is_some() && guard.last_used.elapsed() >= self.idle_probe_threshold {
            if let Some(mut conn) = guard.conn.take() {
                match with_deadline(self.op_timeout, "imap noop", conn.noop()).await {
                    Ok(()) => guard.conn = Some(conn),
                    Err(err) => {
                        debug!("probe_failed proto=imap inbox={} err={}", hash, err);
                    }
                }
            }
        }

        let kind = if guard.conn.is_some() {
            CheckoutKind::Hit
        } else {
            let creds = self.resolver.resolve_imap(inbox_id)?;
            let conn = self.build_with_retry(&creds, &hash).await?;
            guard.conn = Some(conn);
            CheckoutKind::Miss
        };

        guard.last_used = Instant::now();
        match kind {
            CheckoutKind::Hit => guard.hits += 1,
            CheckoutKind::Miss => guard.misses += 1,
        }
        self.ledger.note_checkout(&hash, kind).await;

        Ok(ImapLease {
            guard,
            inbox_id_hash: hash,
            kind,
            op_timeout: self.op_timeout,
        })
    }

    /// Return a handle. `Failed` closes it; the next checkout reconnects.
    pub async fn checkin(&self, mut lease: ImapLease, outcome: CheckinOutcome) {
        if outcome == CheckinOutcome::Failed {
            if let Some(conn) = lease.guard.conn.take() {
                debug!(
                    "handle_closed proto=imap inbox={} reason=checkin_failed",
                    lease.inbox_id_hash
                );
                spawn_logout(conn);
            }
        }
    }

    /// Checkout, `UID SEARCH ALL`, fetch the last `n` messages, checkin.
    pub async fn fetch_recent(
        &self,
        inbox_id: &str,
        n: usize,
    ) -> Result<Vec<Vec<u8>>, ProxyError> {
        let mut lease = self.checkout(inbox_id).await?;
        let started = Instant::now();
        let result = async {
            let uids = lease.uid_search_all().await?;
            let picked: Vec<u32> = uids.iter().rev().take(n).copied().collect();
            let mut messages = Vec::with_capacity(picked.len());
            for uid in picked {
                messages.push(lease.fetch_raw(uid).await?);
            }
            Ok(messages)
        }
        .await;
        debug!(
            "fetch_recent proto=imap inbox={} n={} elapsed_ms={} ok={}",
            lease.inbox_id_hash(),
            n,
            started.elapsed().as_millis(),
            result.is_ok()
        );
        let outcome = if result.is_ok() {
            CheckinOutcome::Success
        } else {
            CheckinOutcome::Failed
        };
        self.checkin(lease, outcome).await;
        result
    }

    /// Hit/miss/live counters for one inbox. Persisted counters are
    /// authoritative; memory is the fallback during a store outage.
    pub async fn stats(&self, inbox_id: &str) -> PoolStatsSnapshot {
        let hash = inbox_hash(inbox_id);
        let live = match self.slots.existing(inbox_id) {
            Some(slot) => match slot.try_lock() {
                Ok(guard) => guard.conn.is_some() as u64,
                Err(_) => 1,
            },
            None => 0,
        };
        match self.ledger.store().get(Protocol::Imap, &hash).await {
            Ok(Some(rec)) => PoolStatsSnapshot {
                hits: rec.stats.hits,
                misses: rec.stats.misses,
                live,
            },
            Ok(None) | Err(_) => {
                let (hits, misses) = self.slots.memory_stats(inbox_id).await;
                PoolStatsSnapshot { hits, misses, live }
            }
        }
    }

    pub fn live_count(&self) -> u64 {
        self.slots.live_count()
    }

    /// Probe the live handle for a session hash, if this instance holds it.
    pub async fn keepalive(&self, inbox_id_hash: &str) -> KeepAliveProbe {
        let inbox_id = match self.slots.inbox_for_hash(inbox_id_hash) {
            Some(id) => id,
            None => return KeepAliveProbe::NotHeld,
        };
        let slot = match self.slots.existing(&inbox_id) {
            Some(slot) => slot,
            None => return KeepAliveProbe::NotHeld,
        };
        let mut guard = match slot.try_lock() {
            Ok(guard) => guard,
            Err(_) => return KeepAliveProbe::Busy,
        };
        let mut conn = match guard.conn.take() {
            Some(conn) => conn,
            None => return KeepAliveProbe::NotHeld,
        };
        match with_deadline(self.op_timeout, "imap noop", conn.noop()).await {
            Ok(()) => {
                guard.conn = Some(conn);
                KeepAliveProbe::NoopOk
            }
            Err(err) => {
                debug!(
                    "keepalive_noop_failed proto=imap inbox={} err={}",
                    inbox_id_hash, err
                );
                KeepAliveProbe::NoopFailed
            }
        }
    }

    /// Raw inbox id for a session hash, if this instance holds its handle.
    pub fn inbox_for_hash(&self, inbox_id_hash: &str) -> Option<String> {
        self.slots.inbox_for_hash(inbox_id_hash)
    }

    /// Close the handle and drop the session record (explicit logout).
    pub async fn close(&self, inbox_id: &str) {
        let hash = inbox_hash(inbox_id);
        if let Some(slot) = self.slots.remove(inbox_id, &hash) {
            let mut guard = slot.lock().await;
            if let Some(mut conn) = guard.conn.take() {
                let _ = with_deadline(self.op_timeout, "imap logout", conn.logout()).await;
                info!("session_closed proto=imap inbox={}", hash);
            }
        }
        self.ledger.note_removed(&hash).await;
    }

    /// Gracefully close every live handle (process shutdown).
    pub async fn shutdown(&self) {
        for slot in self.slots.drain() {
            let mut guard = slot.lock().await;
            if let Some(mut conn) = guard.conn.take() {
                let _ = with_deadline(self.op_timeout, "imap logout", conn.logout()).await;
            }
        }
    }

    async fn build_with_retry(
        &self,
        creds: &Credentials,
        inbox_id_hash: &str,
    ) -> Result<Box<dyn ImapConnection>, ProxyError> {
        let first = match self.build(creds).await {
            Ok(conn) => return Ok(conn),
            Err(err @ ProxyError::UpstreamAuthFailed(_)) => return Err(err),
            Err(err) => err,
        };
        warn!(
            "imap_connect_retry inbox={} err={}",
            inbox_id_hash, first
        );
        match self.build(creds).await {
            Ok(conn) => Ok(conn),
            Err(err @ ProxyError::UpstreamAuthFailed(_)) => Err(err),
            Err(second) => Err(ProxyError::UpstreamUnavailable(format!(
                "two consecutive connect attempts failed: {}; then: {}",
                first, second
            ))),
        }
    }

    async fn build(&self, creds: &Credentials) -> Result<Box<dyn ImapConnection>, ProxyError> {
        let started = Instant::now();
        let conn =
            with_deadline(self.op_timeout, "imap connect", self.connector.connect(creds)).await?;
        debug!(
            "imap_connected host={} elapsed_ms={}",
            creds.host,
            started.elapsed().as_millis()
        );
        Ok(conn)
    }
}

fn spawn_logout(conn: Box<dyn ImapConnection>) {
    tokio::spawn(async move {
        let mut conn = conn;
        let _ = conn.logout().await;
    });
}

fn spawn_close(slot: Arc<tokio::sync::Mutex<crate::pool::Slot<Box<dyn ImapConnection>>>>) {
    tokio::spawn(async move {
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.conn.take() {
            let mut conn = conn;
            let _ = conn.logout().await;
        }
    });
}
