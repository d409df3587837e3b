// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mailbridge core: a connection-pooling IMAP/SMTP proxy for agent clients.
//!
//! The crate fronts per-user IMAP and SMTP accounts on upstream providers and
//! exposes a uniform request/response surface. Live protocol handles are kept
//! warm in per-protocol pools; session metadata lives in a shared key/value
//! store so a restarted instance can find, refresh or retire sessions that a
//! previous instance established. Fetched messages pass through a transformer
//! that produces compact, boilerplate-stripped representations bounded in
//! size for language-model consumption.

pub mod config;
pub mod credentials;
pub mod error;
pub mod ids;
pub mod keepalive;
pub mod pool;
pub mod proxy;
pub mod store;
pub mod transform;

// Re-export key types for convenience (optional, but common)
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::credentials::{AuthKind, CredentialResolver, Credentials};
    pub use crate::error::ProxyError;
    pub use crate::keepalive::KeepAliveWorker;
    pub use crate::pool::{imap::ImapPool, smtp::SmtpPool, CheckinOutcome, PoolStatsSnapshot};
    pub use crate::proxy::{MailProxy, MessagePage, PoolStatsReport, SendMessageRequest};
    pub use crate::store::{Protocol, SessionRecord, SessionStatus, SessionStore};
    pub use crate::transform::{TransformedMessage, Transformer};
}
