// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SMTP connection pool.
//!
//! Same contract shape as the IMAP pool with two differences: there is no
//! mailbox selection (session state is just EHLO'd + authenticated, and a
//! sent message does not invalidate it), and the pool composes the full MIME
//! envelope so handlers never touch message assembly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials as SmtpCredentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::credentials::{AuthKind, CredentialResolver, Credentials};
use crate::error::ProxyError;
use crate::ids::inbox_hash;
use crate::pool::{
    with_deadline, CheckinOutcome, CheckoutKind, KeepAliveProbe, PoolStatsSnapshot, SessionLedger,
    SlotGuard, SlotMap, StoreView,
};
use crate::store::{Protocol, SessionStore};

/// Outbound message as handlers submit it. The pool owns MIME assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Extra headers. Supported names: `Reply-To`, `In-Reply-To`,
    /// `References`; anything else is dropped with a warning.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// One EHLO'd, authenticated SMTP submission session.
#[async_trait]
pub trait SmtpConnection: Send {
    /// Liveness probe (NOOP). A failure means the session is unusable and
    /// the pool rebuilds.
    async fn noop(&mut self) -> Result<(), ProxyError>;

    async fn send(&mut self, message: Message) -> Result<(), ProxyError>;
}

#[async_trait]
pub trait SmtpConnector: Send + Sync {
    async fn connect(&self, creds: &Credentials) -> Result<Box<dyn SmtpConnection>, ProxyError>;
}

/// Production connector over lettre's pooled async transport. STARTTLS on
/// submission ports, implicit TLS on 465; XOAUTH2 when the credentials carry
/// a bearer token.
pub struct LettreSmtpConnector;

#[async_trait]
impl SmtpConnector for LettreSmtpConnector {
    async fn connect(&self, creds: &Credentials) -> Result<Box<dyn SmtpConnection>, ProxyError> {
        let builder = if creds.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&creds.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&creds.host)?
        };
        let mechanisms = match creds.auth_kind {
            AuthKind::Password => vec![Mechanism::Plain, Mechanism::Login],
            AuthKind::OauthBearer => vec![Mechanism::Xoauth2],
        };
        let transport = builder
            .port(creds.port)
            .credentials(SmtpCredentials::new(
                creds.user.clone(),
                creds.secret.clone(),
            ))
            .authentication(mechanisms)
            .build();

        let mut conn = LettreSmtpConnection { transport };
        // EHLO + AUTH happen here, so a bad secret fails the build rather
        // than the first send.
        conn.noop().await?;
        Ok(Box::new(conn))
    }
}

struct LettreSmtpConnection {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl SmtpConnection for LettreSmtpConnection {
    async fn noop(&mut self) -> Result<(), ProxyError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProxyError::UpstreamUnavailable(
                "SMTP NOOP not answered".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&mut self, message: Message) -> Result<(), ProxyError> {
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Exclusive lease on one inbox's SMTP session.
pub struct SmtpLease {
    guard: SlotGuard<Box<dyn SmtpConnection>>,
    inbox_id_hash: String,
    kind: CheckoutKind,
    op_timeout: Duration,
}

impl SmtpLease {
    pub fn kind(&self) -> CheckoutKind {
        self.kind
    }

    pub async fn noop(&mut self) -> Result<(), ProxyError> {
        let result = match self.guard.conn.as_mut() {
            Some(conn) => with_deadline(self.op_timeout, "smtp noop", conn.noop()).await,
            None => Err(closed()),
        };
        self.close_on_failure(result)
    }

    pub async fn send(&mut self, message: Message) -> Result<(), ProxyError> {
        let result = match self.guard.conn.as_mut() {
            Some(conn) => with_deadline(self.op_timeout, "smtp send", conn.send(message)).await,
            None => Err(closed()),
        };
        self.close_on_failure(result)
    }

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
                        "handle_closed proto=smtp inbox={} reason={}",
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

pub struct SmtpPool {
    connector: Arc<dyn SmtpConnector>,
    resolver: Arc<CredentialResolver>,
    ledger: SessionLedger,
    slots: SlotMap<Box<dyn SmtpConnection>>,
    idle_probe_threshold: Duration,
    op_timeout: Duration,
}

impl SmtpPool {
    pub fn new(
        connector: Arc<dyn SmtpConnector>,
        resolver: Arc<CredentialResolver>,
        store: Arc<dyn SessionStore>,
        settings: &Settings,
        instance_id: &str,
    ) -> Self {
        SmtpPool {
            connector,
            resolver,
            ledger: SessionLedger::new(
                store,
                Protocol::Smtp,
                settings.session_ttl(),
                instance_id.to_string(),
            ),
            slots: SlotMap::new(settings.max_live_handles_per_protocol),
            idle_probe_threshold: settings.idle_probe_threshold(),
            op_timeout: Duration::from_secs(settings.timeouts.smtp_op_seconds),
        }
    }

    /// Acquire the single SMTP session for `inbox_id`, building it on first
    /// use. Same exclusivity and probe rules as the IMAP pool.
    pub async fn checkout(&self, inbox_id: &str) -> Result<SmtpLease, ProxyError> {
        let hash = inbox_hash(inbox_id);
        let (slot, evicted) = self.slots.slot_for(inbox_id, &hash);
        if let Some(victim) = evicted {
            drop_slot_conn(victim);
        }

        let mut guard = slot.lock_owned().await;

        if guard.conn.is_some() {
            if let StoreView::Gone = self.ledger.view(&hash).await {
                guard.conn = None;
                debug!("handle_closed proto=smtp inbox={} reason=session_gone", hash);
            }
        }

        if guard.conn.is_some() && guard.last_used.elapsed() >= self.idle_probe_threshold {
            if let Some(mut conn) = guard.conn.take() {
                match with_deadline(self.op_timeout, "smtp noop", conn.noop()).await {
                    Ok(()) => guard.conn = Some(conn),
                    Err(err) => {
                        debug!("probe_failed proto=smtp inbox={} err={}", hash, err);
                    }
                }
            }
        }

        let kind = if guard.conn.is_some() {
            CheckoutKind::Hit
        } else {
            let creds = self.resolver.resolve_smtp(inbox_id)?;
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

        Ok(SmtpLease {
            guard,
            inbox_id_hash: hash,
            kind,
            op_timeout: self.op_timeout,
        })
    }

    pub async fn checkin(&self, mut lease: SmtpLease, outcome: CheckinOutcome) {
        if outcome == CheckinOutcome::Failed {
            if lease.guard.conn.take().is_some() {
                debug!(
                    "handle_closed proto=smtp inbox={} reason=checkin_failed",
                    lease.inbox_id_hash
                );
            }
        }
    }

    /// Compose and submit a message, returning the generated `Message-ID`.
    pub async fn send(
        &self,
        inbox_id: &str,
        request: &SendMessageRequest,
    ) -> Result<String, ProxyError> {
        if request.to.is_empty() {
            return Err(ProxyError::InvalidRequest(
                "at least one recipient required".to_string(),
            ));
        }
        let creds = self.resolver.resolve_smtp(inbox_id)?;
        let message_id = new_message_id(&creds.user);
        let message = compose(&creds, request, &message_id)?;

        let mut lease = self.checkout(inbox_id).await?;
        let started = Instant::now();
        let result = lease.send(message).await;
        debug!(
            "send proto=smtp inbox={} elapsed_ms={} ok={}",
            lease.inbox_id_hash,
            started.elapsed().as_millis(),
            result.is_ok()
        );
        let outcome = if result.is_ok() {
            CheckinOutcome::Success
        } else {
            CheckinOutcome::Failed
        };
        let hash = lease.inbox_id_hash.clone();
        self.checkin(lease, outcome).await;

        result.map(|_| {
            info!("message_sent inbox={} recipients={}", hash, request.to.len());
            message_id
        })
    }

    pub async fn stats(&self, inbox_id: &str) -> PoolStatsSnapshot {
        let hash = inbox_hash(inbox_id);
        let live = match self.slots.existing(inbox_id) {
            Some(slot) => match slot.try_lock() {
                Ok(guard) => guard.conn.is_some() as u64,
                Err(_) => 1,
            },
            None => 0,
        };
        match self.ledger.store().get(Protocol::Smtp, &hash).await {
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
        match with_deadline(self.op_timeout, "smtp noop", conn.noop()).await {
            Ok(()) => {
                guard.conn = Some(conn);
                KeepAliveProbe::NoopOk
            }
            Err(err) => {
                debug!(
                    "keepalive_noop_failed proto=smtp inbox={} err={}",
                    inbox_id_hash, err
                );
                KeepAliveProbe::NoopFailed
            }
        }
    }

    pub fn inbox_for_hash(&self, inbox_id_hash: &str) -> Option<String> {
        self.slots.inbox_for_hash(inbox_id_hash)
    }

    pub async fn close(&self, inbox_id: &str) {
        let hash = inbox_hash(inbox_id);
        if let Some(slot) = self.slots.remove(inbox_id, &hash) {
            let mut guard = slot.lock().await;
            if guard.conn.take().is_some() {
                info!("session_closed proto=smtp inbox={}", hash);
            }
        }
        self.ledger.note_removed(&hash).await;
    }

    pub async fn shutdown(&self) {
        for slot in self.slots.drain() {
            let mut guard = slot.lock().await;
            guard.conn = None;
        }
    }

    async fn build_with_retry(
        &self,
        creds: &Credentials,
        inbox_id_hash: &str,
    ) -> Result<Box<dyn SmtpConnection>, ProxyError> {
        let first = match self.build(creds).await {
            Ok(conn) => return Ok(conn),
            Err(err @ ProxyError::UpstreamAuthFailed(_)) => return Err(err),
            Err(err) => err,
        };
        warn!("smtp_connect_retry inbox={} err={}", inbox_id_hash, first);
        match self.build(creds).await {
            Ok(conn) => Ok(conn),
            Err(err @ ProxyError::UpstreamAuthFailed(_)) => Err(err),
            Err(second) => Err(ProxyError::UpstreamUnavailable(format!(
                "two consecutive connect attempts failed: {}; then: {}",
                first, second
            ))),
        }
    }

    async fn build(&self, creds: &Credentials) -> Result<Box<dyn SmtpConnection>, ProxyError> {
        let started = Instant::now();
        let conn =
            with_deadline(self.op_timeout, "smtp connect", self.connector.connect(creds)).await?;
        debug!(
            "smtp_connected host={} elapsed_ms={}",
            creds.host,
            started.elapsed().as_millis()
        );
        Ok(conn)
    }
}

fn drop_slot_conn(slot: Arc<tokio::sync::Mutex<crate::pool::Slot<Box<dyn SmtpConnection>>>>) {
    tokio::spawn(async move {
        let mut guard = slot.lock().await;
        guard.conn = None;
    });
}

fn new_message_id(user: &str) -> String {
    let domain = user.split('@').nth(1).unwrap_or("mailbridge.local");
    format!("<{}@{}>", Uuid::new_v4().simple(), domain)
}

fn compose(
    creds: &Credentials,
    request: &SendMessageRequest,
    message_id: &str,
) -> Result<Message, ProxyError> {
    let from: Mailbox = creds.user.parse()?;
    let mut builder = Message::builder()
        .from(from)
        .subject(request.subject.clone())
        .message_id(Some(message_id.to_string()));
    for to in &request.to {
        builder = builder.to(to.parse()?);
    }
    for cc in &request.cc {
        builder = builder.cc(cc.parse()?);
    }
    for bcc in &request.bcc {
        builder = builder.bcc(bcc.parse()?);
    }
    for (name, value) in &request.headers {
        match name.to_ascii_lowercase().as_str() {
            "reply-to" => builder = builder.reply_to(value.parse()?),
            "in-reply-to" => builder = builder.in_reply_to(value.clone()),
            "references" => builder = builder.references(value.clone()),
            other => warn!("unsupported_header name={}", other),
        }
    }
    builder
        .header(ContentType::TEXT_PLAIN)
        .body(request.body.clone())
        .map_err(Into::into)
}
