// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Attachment text extraction capability.
//!
//! PDF (and any future binary format) extraction is injected rather than
//! bundled; deployments wire in whatever extractor they run. An attachment
//! whose extractor is missing or fails is kept with `extracted_text = None`,
//! never dropped.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    Unsupported(String),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Turns attachment bytes into text, when the content type is supported.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<String, ExtractError>;
}

/// Default capability: supports nothing. Attachments still flow through with
/// metadata intact.
pub struct NoopExtractor;

#[async_trait]
impl TextExtractor for NoopExtractor {
    async fn extract(&self, _bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
        Err(ExtractError::Unsupported(content_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_extractor_is_unsupported() {
        let err = NoopExtractor
            .extract(b"%PDF-1.4", "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }
}
