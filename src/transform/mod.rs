// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Message-to-RAG transformation.
//!
//! Takes raw RFC 5322/MIME bytes and produces a compact representation for
//! language-model consumption: plain-text body with signatures, tracking
//! pixels and deep quote chains stripped, per-attachment extracted text, and
//! a stable thread identifier. The transformer never fails; malformed input
//! degrades to an empty body plus an `errors` list.

pub mod extract;
pub mod html;
pub mod quotes;

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use mail_parser::{Addr, Address, HeaderValue, Message, MessageParser, MimeHeaders, PartType};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::Settings;
use self::extract::{ExtractError, TextExtractor};
use self::quotes::collapse_quotes;

/// Appended when the body exceeds its limit; the marker fits inside the
/// limit, so `body.chars().count()` never exceeds it.
const BODY_TRUNCATION_MARKER: &str = "…\n[truncated]";
const ATTACHMENT_TRUNCATION_MARKER: &str = "…";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TransformedMessage {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub thread_id: String,
    pub errors: Vec<String>,
}

impl TransformedMessage {
    fn degraded(error: String) -> Self {
        TransformedMessage {
            subject: String::new(),
            from: String::new(),
            to: String::new(),
            date: String::new(),
            body: String::new(),
            attachments: Vec::new(),
            thread_id: String::new(),
            errors: vec![error],
        }
    }
}

pub struct Transformer {
    body_char_limit: usize,
    attachment_char_limit: usize,
    tracking_hosts: Vec<String>,
    extractor: Arc<dyn TextExtractor>,
    extractor_timeout: Duration,
}

impl Transformer {
    pub fn new(settings: &Settings, extractor: Arc<dyn TextExtractor>) -> Self {
        Transformer {
            body_char_limit: settings.transformer.body_char_limit,
            attachment_char_limit: settings.transformer.attachment_char_limit,
            tracking_hosts: settings.transformer.tracking_host_patterns.clone(),
            extractor,
            extractor_timeout: Duration::from_secs(settings.timeouts.extractor_seconds),
        }
    }

    /// Transform raw MIME bytes. Pure apart from the injected extractor, and
    /// safe to run concurrently.
    pub async fn transform(&self, raw: &[u8]) -> TransformedMessage {
        let Some(message) = MessageParser::default().parse(raw) else {
            return TransformedMessage::degraded("unparseable MIME payload".to_string());
        };

        let mut errors = Vec::new();

        // Prefer a true text/plain part; degrade HTML to text otherwise.
        let raw_body = if let Some(text) = plain_part(&message) {
            text.to_string()
        } else if let Some(markup) = html_part(&message) {
            html::html_to_text(markup, &self.tracking_hosts)
        } else {
            String::new()
        };

        let body = collapse_quotes(&raw_body);
        let body = squeeze_blank_lines(&body);
        let body = clip_chars(body.trim(), self.body_char_limit, BODY_TRUNCATION_MARKER);

        let attachments = self.extract_attachments(&message, &mut errors).await;

        TransformedMessage {
            subject: message.subject().unwrap_or_default().to_string(),
            from: format_address(message.from()),
            to: format_address(message.to()),
            date: message.date().map(|d| d.to_rfc3339()).unwrap_or_default(),
            thread_id: thread_id(&message),
            body,
            attachments,
            errors,
        }
    }

    async fn extract_attachments(
        &self,
        message: &Message<'_>,
        errors: &mut Vec<String>,
    ) -> Vec<Attachment> {
        let mut out = Vec::new();
        for part in message.attachments() {
            let filename = part.attachment_name().unwrap_or("unnamed").to_string();
            let content_type = content_type_string(part);
            let bytes = part.contents();

            let extracted_text = if content_type == "application/pdf" {
                self.run_extractor(bytes, &content_type, &filename).await
            } else if content_type.starts_with("text/") {
                // mail-parser has already decoded declared charsets; raw
                // bytes fall back to lossy UTF-8.
                match &part.body {
                    PartType::Text(text) => Some(text.to_string()),
                    _ => Some(String::from_utf8_lossy(bytes).into_owned()),
                }
            } else {
                None
            };

            if extracted_text.is_none() && content_type == "application/pdf" {
                // Recorded once per message so callers can see degradation.
                if !errors.iter().any(|e| e.starts_with("no text extracted")) {
                    errors.push(format!("no text extracted from {}", filename));
                }
            }

            out.push(Attachment {
                filename,
                content_type,
                size: bytes.len(),
                extracted_text: extracted_text
                    .map(|t| clip_chars(&t, self.attachment_char_limit, ATTACHMENT_TRUNCATION_MARKER)),
            });
        }
        out
    }

    async fn run_extractor(
        &self,
        bytes: &[u8],
        content_type: &str,
        filename: &str,
    ) -> Option<String> {
        let attempt = tokio::time::timeout(
            self.extractor_timeout,
            self.extractor.extract(bytes, content_type),
        )
        .await;
        match attempt {
            Ok(Ok(text)) => Some(text),
            Ok(Err(ExtractError::Unsupported(_))) => None,
            Ok(Err(ExtractError::Failed(reason))) => {
                debug!("extractor_failed file={} err={}", filename, reason);
                None
            }
            Err(_elapsed) => {
                debug!("extractor_timeout file={}", filename);
                None
            }
        }
    }
}

fn plain_part<'a>(message: &'a Message<'_>) -> Option<&'a str> {
    for part_id in &message.text_body {
        if let Some(part) = message.parts.get(*part_id) {
            if let PartType::Text(text) = &part.body {
                return Some(text.as_ref());
            }
        }
    }
    None
}

fn html_part<'a>(message: &'a Message<'_>) -> Option<&'a str> {
    for part_id in &message.html_body {
        if let Some(part) = message.parts.get(*part_id) {
            if let PartType::Html(markup) = &part.body {
                return Some(markup.as_ref());
            }
        }
    }
    None
}

fn content_type_string(part: &mail_parser::MessagePart<'_>) -> String {
    match part.content_type() {
        Some(ct) => match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype).to_ascii_lowercase(),
            None => ct.ctype().to_ascii_lowercase(),
        },
        None => "application/octet-stream".to_string(),
    }
}

fn format_address(address: Option<&Address<'_>>) -> String {
    let Some(list) = address.and_then(|a| a.as_list()) else {
        return String::new();
    };
    list.iter()
        .map(format_addr)
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_addr(addr: &Addr<'_>) -> String {
    match (&addr.name, &addr.address) {
        (Some(name), Some(email)) => format!("{} <{}>", name, email),
        (None, Some(email)) => email.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Stable 12-hex thread identifier.
///
/// Header chain first: the last entry of `References` (the direct parent),
/// else `In-Reply-To`. Without either, hash the normalised subject plus the
/// sorted participant set so subject-only threads still group.
fn thread_id(message: &Message<'_>) -> String {
    if let Some(last) = last_reference(message.references()) {
        return digest12(last);
    }
    if let Some(parent) = message.in_reply_to().as_text() {
        return digest12(parent);
    }

    let subject = normalize_subject(message.subject().unwrap_or_default());
    let mut participants: Vec<String> = Vec::new();
    collect_emails(message.from(), &mut participants);
    collect_emails(message.to(), &mut participants);
    participants.sort();
    participants.dedup();
    digest12(&format!("{}|{}", subject, participants.join(";")))
}

fn last_reference<'a>(value: &'a HeaderValue<'_>) -> Option<&'a str> {
    if let Some(list) = value.as_text_list() {
        return list.last().copied();
    }
    value.as_text()
}

fn collect_emails(address: Option<&Address<'_>>, out: &mut Vec<String>) {
    let Some(list) = address.and_then(|a| a.as_list()) else {
        return;
    };
    for addr in list {
        if let Some(email) = &addr.address {
            out.push(email.to_ascii_lowercase());
        }
    }
}

fn normalize_subject(subject: &str) -> String {
    lazy_static! {
        static ref REPLY_PREFIX: Regex = Regex::new(r"(?i)^(re|fw|fwd)\s*:\s*").unwrap();
        static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    }
    let mut subject = subject.trim();
    while let Some(found) = REPLY_PREFIX.find(subject) {
        subject = subject[found.end()..].trim_start();
    }
    WHITESPACE
        .replace_all(&subject.to_lowercase(), " ")
        .trim()
        .to_string()
}

fn digest12(input: &str) -> String {
    use std::fmt::Write as _;
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(12);
    for byte in &digest[..6] {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn squeeze_blank_lines(body: &str) -> String {
    lazy_static! {
        static ref BLANK_RUN: Regex = Regex::new(r"\n{3,}").unwrap();
    }
    BLANK_RUN.replace_all(body, "\n\n").into_owned()
}

/// Clip to `limit` Unicode scalar values, marker included, so the output
/// never exceeds the limit.
fn clip_chars(text: &str, limit: usize, marker: &str) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(marker.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(marker);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::extract::NoopExtractor;

    fn transformer() -> Transformer {
        Transformer::new(&Settings::default(), Arc::new(NoopExtractor))
    }

    fn plain_mail(body: &str) -> Vec<u8> {
        format!(
            "From: alice@x.com\r\nTo: bob@y.com\r\nSubject: Greeting\r\n\
             Message-ID: <m1@x.com>\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            body
        )
        .into_bytes()
    }

    fn html_mail(markup: &str) -> Vec<u8> {
        format!(
            "From: alice@x.com\r\nTo: bob@y.com\r\nSubject: Greeting\r\n\
             Content-Type: text/html; charset=utf-8\r\n\r\n{}",
            markup
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_html_signature_is_stripped() {
        let raw = html_mail("<p>Hi</p><div class='signature'>-- Alice</div>");
        let msg = transformer().transform(&raw).await;
        assert_eq!(msg.body, "Hi");
        assert_eq!(msg.subject, "Greeting");
    }

    #[tokio::test]
    async fn test_deep_quotes_collapse() {
        let raw = plain_mail("Top\n> L1\n>> L2\n>>> L3a\n>>> L3b\n>>>> L4");
        let msg = transformer().transform(&raw).await;
        assert_eq!(msg.body, "Top\n> L1\n>> L2\n[Quoted text collapsed]");
    }

    #[tokio::test]
    async fn test_tracking_pixel_leaves_only_text() {
        let raw = html_mail("<p>Visible text</p><img src='x' width='1' height='1'>");
        let msg = transformer().transform(&raw).await;
        assert!(msg.body.contains("Visible text"));
        assert!(!msg.body.contains("src"));
    }

    #[tokio::test]
    async fn test_plain_part_is_preferred_over_html() {
        let raw = b"From: alice@x.com\r\nTo: bob@y.com\r\nSubject: Alt\r\n\
            Content-Type: multipart/alternative; boundary=SEP\r\n\r\n\
            --SEP\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nplain version\r\n\
            --SEP\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<p>html version</p>\r\n\
            --SEP--\r\n"
            .to_vec();
        let msg = transformer().transform(&raw).await;
        assert_eq!(msg.body, "plain version");
    }

    #[tokio::test]
    async fn test_body_is_bounded() {
        let mut settings = Settings::default();
        settings.transformer.body_char_limit = 50;
        let transformer = Transformer::new(&settings, Arc::new(NoopExtractor));
        let raw = plain_mail(&"x".repeat(500));
        let msg = transformer.transform(&raw).await;
        assert_eq!(msg.body.chars().count(), 50);
        assert!(msg.body.ends_with("…\n[truncated]"));
    }

    #[tokio::test]
    async fn test_short_body_is_untouched() {
        let raw = plain_mail("short body");
        let msg = transformer().transform(&raw).await;
        assert_eq!(msg.body, "short body");
    }

    #[tokio::test]
    async fn test_transform_is_idempotent_on_clean_text() {
        let first = transformer().transform(&plain_mail("Plain note.\n> one level")).await;
        let second = transformer().transform(&plain_mail(&first.body)).await;
        assert_eq!(second.body, first.body);
    }

    #[tokio::test]
    async fn test_malformed_mime_degrades() {
        let msg = transformer().transform(b"").await;
        assert!(msg.body.is_empty());
        assert!(!msg.errors.is_empty());
    }

    #[tokio::test]
    async fn test_thread_id_from_references_chain() {
        let mail = |msg_id: &str| {
            format!(
                "From: alice@x.com\r\nTo: bob@y.com\r\nSubject: Thread\r\n\
                 Message-ID: <{}@x.com>\r\nReferences: <root@x.com> <parent@x.com>\r\n\
                 Content-Type: text/plain\r\n\r\nbody",
                msg_id
            )
            .into_bytes()
        };
        let t = transformer();
        let a = t.transform(&mail("m1")).await;
        let b = t.transform(&mail("m2")).await;
        assert_eq!(a.thread_id, b.thread_id);
        assert_eq!(a.thread_id.len(), 12);
    }

    #[tokio::test]
    async fn test_thread_id_falls_back_to_in_reply_to() {
        let raw = b"From: alice@x.com\r\nTo: bob@y.com\r\nSubject: T\r\n\
            In-Reply-To: <parent@x.com>\r\nContent-Type: text/plain\r\n\r\nbody"
            .to_vec();
        let with_refs = b"From: alice@x.com\r\nTo: bob@y.com\r\nSubject: T\r\n\
            References: <parent@x.com>\r\nContent-Type: text/plain\r\n\r\nbody"
            .to_vec();
        let t = transformer();
        let a = t.transform(&raw).await;
        let b = t.transform(&with_refs).await;
        // Same direct parent, same thread.
        assert_eq!(a.thread_id, b.thread_id);
    }

    #[tokio::test]
    async fn test_thread_id_subject_fallback_normalizes() {
        let mail = |subject: &str, from: &str, to: &str| {
            format!(
                "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain\r\n\r\nbody",
                from, to, subject
            )
            .into_bytes()
        };
        let t = transformer();
        let a = t.transform(&mail("Re: Budget   Plan", "alice@x.com", "bob@y.com")).await;
        let b = t.transform(&mail("FWD: budget plan", "Bob@y.com", "Alice@x.com")).await;
        assert_eq!(a.thread_id, b.thread_id);

        let c = t.transform(&mail("budget plan", "alice@x.com", "carol@z.com")).await;
        assert_ne!(a.thread_id, c.thread_id);
    }

    #[tokio::test]
    async fn test_text_attachment_is_decoded_and_clipped() {
        let mut settings = Settings::default();
        settings.transformer.attachment_char_limit = 10;
        let transformer = Transformer::new(&settings, Arc::new(NoopExtractor));
        let raw = b"From: alice@x.com\r\nTo: bob@y.com\r\nSubject: Files\r\n\
            Content-Type: multipart/mixed; boundary=SEP\r\n\r\n\
            --SEP\r\nContent-Type: text/plain\r\n\r\ncover note\r\n\
            --SEP\r\nContent-Type: text/csv\r\n\
            Content-Disposition: attachment; filename=\"data.csv\"\r\n\r\n\
            a,b,c,d,e,f,g,h,i,j,k\r\n\
            --SEP--\r\n"
            .to_vec();
        let msg = transformer.transform(&raw).await;
        assert_eq!(msg.attachments.len(), 1);
        let att = &msg.attachments[0];
        assert_eq!(att.filename, "data.csv");
        assert_eq!(att.content_type, "text/csv");
        let text = att.extracted_text.as_ref().expect("text");
        assert_eq!(text.chars().count(), 10);
        assert!(text.ends_with('…'));
    }

    #[tokio::test]
    async fn test_pdf_attachment_without_extractor_keeps_metadata() {
        let raw = b"From: alice@x.com\r\nTo: bob@y.com\r\nSubject: Files\r\n\
            Content-Type: multipart/mixed; boundary=SEP\r\n\r\n\
            --SEP\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n\
            --SEP\r\nContent-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"report.pdf\"\r\n\r\n\
            %PDF-1.4 fake\r\n\
            --SEP--\r\n"
            .to_vec();
        let msg = transformer().transform(&raw).await;
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].content_type, "application/pdf");
        assert!(msg.attachments[0].extracted_text.is_none());
        assert!(msg.attachments[0].size > 0);
    }

    #[tokio::test]
    async fn test_pdf_attachment_with_extractor() {
        struct FixedExtractor;

        #[async_trait::async_trait]
        impl TextExtractor for FixedExtractor {
            async fn extract(
                &self,
                _bytes: &[u8],
                _content_type: &str,
            ) -> Result<String, ExtractError> {
                Ok("quarterly numbers".to_string())
            }
        }

        let transformer = Transformer::new(&Settings::default(), Arc::new(FixedExtractor));
        let raw = b"From: alice@x.com\r\nTo: bob@y.com\r\nSubject: Files\r\n\
            Content-Type: multipart/mixed; boundary=SEP\r\n\r\n\
            --SEP\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n\
            --SEP\r\nContent-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"report.pdf\"\r\n\r\n\
            %PDF-1.4 fake\r\n\
            --SEP--\r\n"
            .to_vec();
        let msg = transformer.transform(&raw).await;
        assert_eq!(
            msg.attachments[0].extracted_text.as_deref(),
            Some("quarterly numbers")
        );
    }

    #[tokio::test]
    async fn test_json_shape_for_adapters() {
        let msg = transformer().transform(&plain_mail("hello")).await;
        let json = serde_json::to_value(&msg).expect("json");
        assert_eq!(json["subject"], "Greeting");
        assert_eq!(json["body"], "hello");
        assert_eq!(json["from"], "alice@x.com");
        assert!(json["attachments"].as_array().unwrap().is_empty());
        assert!(json["errors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_subject_normalization() {
        assert_eq!(normalize_subject("Re: Re: FWD: Hello  World"), "hello world");
        assert_eq!(normalize_subject("  Plain  "), "plain");
        assert_eq!(normalize_subject(""), "");
    }

    #[test]
    fn test_clip_chars_boundary() {
        assert_eq!(clip_chars("abc", 3, "…"), "abc");
        assert_eq!(clip_chars("abcd", 3, "…"), "ab…");
        assert_eq!(clip_chars("abcd", 3, "…").chars().count(), 3);
    }
}
