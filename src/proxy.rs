// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Handler layer: the operations an API adapter binds to.
//!
//! Thin by design. Each operation resolves credentials, leases a pooled
//! handle, runs the protocol work, pushes fetched messages through the
//! transformer, and lets the pool account for the checkout in the session
//! store. No HTTP types live here; the REST facade is a separate adapter.

use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::config::Settings;
use crate::credentials::CredentialResolver;
use crate::error::ProxyError;
use crate::ids::{inbox_hash, instance_id};
use crate::keepalive::KeepAliveWorker;
use crate::pool::imap::{ImapPool, TlsImapConnector};
use crate::pool::smtp::{LettreSmtpConnector, SmtpPool};
use crate::pool::{CheckinOutcome, PoolStatsSnapshot};
use crate::store::{MemorySessionStore, RedisSessionStore, SessionStore};
use crate::transform::extract::{NoopExtractor, TextExtractor};
use crate::transform::{TransformedMessage, Transformer};

pub use crate::pool::smtp::SendMessageRequest;

/// A page of transformed messages, newest first. `next_cursor` feeds the next
/// `list_messages` call; `None` means the mailbox is exhausted.
#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<TransformedMessage>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PoolStatsReport {
    PerInbox {
        imap: PoolStatsSnapshot,
        smtp: PoolStatsSnapshot,
    },
    Aggregate {
        hits: u64,
        misses: u64,
        live_imap: u64,
        live_smtp: u64,
    },
}

pub struct MailProxy {
    store: Arc<dyn SessionStore>,
    imap: Arc<ImapPool>,
    smtp: Arc<SmtpPool>,
    resolver: Arc<CredentialResolver>,
    transformer: Transformer,
    keepalive_interval: std::time::Duration,
}

impl MailProxy {
    /// Wire the proxy with explicit collaborators. The composition seam used
    /// by tests and by deployments with custom connectors or extractors.
    pub fn new(
        settings: &Settings,
        store: Arc<dyn SessionStore>,
        imap_connector: Arc<dyn crate::pool::imap::ImapConnector>,
        smtp_connector: Arc<dyn crate::pool::smtp::SmtpConnector>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Self {
        let resolver = Arc::new(CredentialResolver::new(settings));
        let instance = instance_id();
        let imap = Arc::new(ImapPool::new(
            imap_connector,
            Arc::clone(&resolver),
            Arc::clone(&store),
            settings,
            &instance,
        ));
        let smtp = Arc::new(SmtpPool::new(
            smtp_connector,
            Arc::clone(&resolver),
            Arc::clone(&store),
            settings,
            &instance,
        ));
        MailProxy {
            transformer: Transformer::new(settings, extractor),
            keepalive_interval: settings.keepalive_interval(),
            store,
            imap,
            smtp,
            resolver,
        }
    }

    /// Production wiring: Redis-backed store when `store_url` is configured
    /// (falling back to memory-only if it cannot be reached), TLS connectors,
    /// no attachment extractor.
    pub async fn from_settings(settings: &Settings) -> Result<Self, ProxyError> {
        let store: Arc<dyn SessionStore> = match &settings.store_url {
            Some(url) => {
                let timeout =
                    std::time::Duration::from_secs(settings.timeouts.store_op_seconds);
                match RedisSessionStore::connect(url, timeout).await {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        log::warn!("store_unreachable op=connect err={}; using memory store", e);
                        Arc::new(MemorySessionStore::new())
                    }
                }
            }
            None => Arc::new(MemorySessionStore::new()),
        };
        Ok(MailProxy::new(
            settings,
            store,
            Arc::new(TlsImapConnector::new()?),
            Arc::new(LettreSmtpConnector),
            Arc::new(NoopExtractor),
        ))
    }

    /// The keep-alive worker bound to this proxy's pools and store.
    pub fn keepalive_worker(&self) -> KeepAliveWorker {
        KeepAliveWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.imap),
            Arc::clone(&self.smtp),
            Arc::clone(&self.resolver),
            self.keepalive_interval,
        )
    }

    pub fn imap_pool(&self) -> &Arc<ImapPool> {
        &self.imap
    }

    pub fn smtp_pool(&self) -> &Arc<SmtpPool> {
        &self.smtp
    }

    /// List transformed messages, newest first.
    ///
    /// The cursor is an opaque offset from the newest message, handed back as
    /// `next_cursor` by the previous page.
    pub async fn list_messages(
        &self,
        inbox_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ProxyError> {
        let offset: usize = match cursor {
            Some(raw) => raw
                .parse()
                .map_err(|_| ProxyError::InvalidRequest(format!("bad cursor: {}", raw)))?,
            None => 0,
        };
        let limit = limit.max(1);

        let mut lease = self.imap.checkout(inbox_id).await?;
        let result: Result<(Vec<Vec<u8>>, usize), ProxyError> = async {
            let uids = lease.uid_search_all().await?;
            let total = uids.len();
            let window: Vec<u32> = uids
                .iter()
                .rev()
                .skip(offset)
                .take(limit)
                .copied()
                .collect();
            let mut raw_messages = Vec::with_capacity(window.len());
            for uid in window {
                raw_messages.push(lease.fetch_raw(uid).await?);
            }
            Ok((raw_messages, total))
        }
        .await;

        let outcome = if result.is_ok() {
            CheckinOutcome::Success
        } else {
            CheckinOutcome::Failed
        };
        self.imap.checkin(lease, outcome).await;

        let (raw_messages, total) = result?;
        let mut messages = Vec::with_capacity(raw_messages.len());
        for raw in &raw_messages {
            messages.push(self.transformer.transform(raw).await);
        }

        let consumed = offset + messages.len();
        let next_cursor = (consumed < total).then(|| consumed.to_string());
        debug!(
            "list_messages inbox={} returned={} total={}",
            inbox_hash(inbox_id),
            messages.len(),
            total
        );
        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    /// Fetch and transform one message by UID.
    pub async fn get_message(
        &self,
        inbox_id: &str,
        message_uid: u32,
    ) -> Result<TransformedMessage, ProxyError> {
        let mut lease = self.imap.checkout(inbox_id).await?;
        let result = lease.fetch_raw(message_uid).await;
        let outcome = if result.is_ok() {
            CheckinOutcome::Success
        } else {
            CheckinOutcome::Failed
        };
        self.imap.checkin(lease, outcome).await;
        Ok(self.transformer.transform(&result?).await)
    }

    /// Compose and send a message; returns its `Message-ID`.
    pub async fn send_message(
        &self,
        inbox_id: &str,
        request: &SendMessageRequest,
    ) -> Result<String, ProxyError> {
        self.smtp.send(inbox_id, request).await
    }

    /// Hit/miss/live counters, per inbox or aggregated across all inboxes.
    /// Persisted counters win; memory is the store-outage fallback.
    pub async fn pool_stats(&self, inbox_id: Option<&str>) -> PoolStatsReport {
        match inbox_id {
            Some(inbox_id) => PoolStatsReport::PerInbox {
                imap: self.imap.stats(inbox_id).await,
                smtp: self.smtp.stats(inbox_id).await,
            },
            None => {
                let (hits, misses) = match self.store.global_stats().await {
                    Ok(stats) => (stats.hits, stats.misses),
                    Err(e) => {
                        debug!("store_unreachable op=global_stats err={}", e);
                        (0, 0)
                    }
                };
                PoolStatsReport::Aggregate {
                    hits,
                    misses,
                    live_imap: self.imap.live_count(),
                    live_smtp: self.smtp.live_count(),
                }
            }
        }
    }

    /// Close both live handles and destroy both session records.
    pub async fn logout(&self, inbox_id: &str) {
        self.imap.close(inbox_id).await;
        self.smtp.close(inbox_id).await;
    }

    /// Gracefully close every pooled handle.
    pub async fn shutdown(&self) {
        self.imap.shutdown().await;
        self.smtp.shutdown().await;
    }
}
