// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error kinds surfaced by the proxy core.
//!
//! Store failures are deliberately *not* represented here as hard errors in
//! most paths: the pools swallow them and degrade to memory-only operation,
//! and only `pool_stats`-style read paths ever report `StoreUnavailable`.
//! The transformer never errors at all; it degrades (see `transform`).

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The inbox id has no configured credentials. Carries the inbox hash,
    /// never the raw id.
    #[error("inbox not found: {0}")]
    NotFound(String),

    /// OAuth token for the inbox is past its expiry. Carries the inbox hash.
    #[error("credentials expired for inbox {0}")]
    CredentialExpired(String),

    /// LOGIN/AUTH was rejected by the upstream. Not retryable within the
    /// request.
    #[error("upstream authentication failed: {0}")]
    UpstreamAuthFailed(String),

    /// Two consecutive rebuild attempts failed, or the upstream could not be
    /// reached. Request-level retryable; the bad handle is already closed.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Tagged NO/BAD on an otherwise-legal command. The handle is closed.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    /// The session store could not be reached on a path that needed it.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// A deadline elapsed mid-operation. The affected handle is closed rather
    /// than left in a half-spoken tagged state.
    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    /// Malformed caller input (bad cursor, unparseable address, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        ProxyError::StoreUnavailable(err.to_string())
    }
}

impl From<async_imap::error::Error> for ProxyError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;
        match err {
            ImapError::No(msg) => ProxyError::UpstreamProtocolError(format!("NO: {}", msg)),
            ImapError::Bad(msg) => ProxyError::UpstreamProtocolError(format!("BAD: {}", msg)),
            ImapError::Parse(e) => ProxyError::UpstreamProtocolError(e.to_string()),
            ImapError::Validate(e) => ProxyError::InvalidRequest(e.to_string()),
            ImapError::ConnectionLost => {
                ProxyError::UpstreamUnavailable("connection lost".to_string())
            }
            ImapError::Io(e) => ProxyError::UpstreamUnavailable(e.to_string()),
            other => ProxyError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<lettre::transport::smtp::Error> for ProxyError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        // Permanent (5xx) rejections during EHLO/AUTH are credential problems;
        // everything else is a transport fault worth retrying at request level.
        if err.is_permanent() {
            ProxyError::UpstreamAuthFailed(err.to_string())
        } else {
            ProxyError::UpstreamUnavailable(err.to_string())
        }
    }
}

impl From<lettre::error::Error> for ProxyError {
    fn from(err: lettre::error::Error) -> Self {
        ProxyError::InvalidRequest(err.to_string())
    }
}

impl From<lettre::address::AddressError> for ProxyError {
    fn from(err: lettre::address::AddressError) -> Self {
        ProxyError::InvalidRequest(format!("address: {}", err))
    }
}

impl From<native_tls::Error> for ProxyError {
    fn from(err: native_tls::Error) -> Self {
        ProxyError::UpstreamUnavailable(format!("tls: {}", err))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::UpstreamUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imap_no_maps_to_protocol_error() {
        let err: ProxyError = async_imap::error::Error::No("nope".into()).into();
        assert!(matches!(err, ProxyError::UpstreamProtocolError(_)));
    }

    #[test]
    fn test_store_error_maps_to_store_unavailable() {
        let err: ProxyError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(err, ProxyError::StoreUnavailable(_)));
    }
}
