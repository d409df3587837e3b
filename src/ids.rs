//! Privacy-safe identifiers.
//!
//! Inbox ids (conventionally the user's email address) are never logged or
//! persisted raw. Everything that leaves process memory uses the stable
//! 12-hex-char SHA-256 prefix produced here.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

/// Stable one-way hash of an inbox id: first 12 hex chars of SHA-256.
pub fn inbox_hash(inbox_id: &str) -> String {
    let digest = Sha256::digest(inbox_id.as_bytes());
    let mut out = String::with_capacity(12);
    for byte in &digest[..6] {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Random id identifying this proxy instance for the lifetime of the process.
pub fn instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_hash_is_stable_and_short() {
        let a = inbox_hash("u@x.com");
        let b = inbox_hash("u@x.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_inbox_hash_differs_per_inbox() {
        assert_ne!(inbox_hash("a@x.com"), inbox_hash("b@x.com"));
    }

    #[test]
    fn test_instance_id_length() {
        assert_eq!(instance_id().len(), 12);
    }
}
