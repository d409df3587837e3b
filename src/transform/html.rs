// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! HTML body cleanup.
//!
//! Parses the HTML part, drops boilerplate subtrees (scripts, styles,
//! signature/footer/disclaimer blocks, tracking pixels), and renders the
//! remainder to plain text.

use ego_tree::NodeRef;
use scraper::node::{Element, Node};
use scraper::Html;

/// Class/id fragments that mark a subtree as signature boilerplate.
const SIGNATURE_MARKERS: [&str; 4] = ["signature", "email-signature", "footer", "disclaimer"];

/// Elements whose content never belongs in a text rendering.
const DROPPED_ELEMENTS: [&str; 3] = ["script", "style", "head"];

const VOID_ELEMENTS: [&str; 6] = ["img", "br", "hr", "input", "meta", "link"];

/// Convert an HTML body to cleaned plain text.
///
/// `tracking_hosts` are case-insensitive substrings matched against image
/// `src` values; matches are stripped alongside 1x1 pixels.
pub fn html_to_text(html: &str, tracking_hosts: &[String]) -> String {
    let sanitized = sanitize(html, tracking_hosts);
    html2text::from_read(sanitized.as_bytes(), 80)
}

/// Re-serialize the fragment with boilerplate subtrees removed.
fn sanitize(html: &str, tracking_hosts: &[String]) -> String {
    let fragment = Html::parse_fragment(html);
    let mut sanitized = String::with_capacity(html.len());
    emit(fragment.tree.root(), &mut sanitized, tracking_hosts);
    sanitized
}

fn emit(node: NodeRef<'_, Node>, out: &mut String, tracking_hosts: &[String]) {
    match node.value() {
        Node::Element(element) => {
            let name = element.name();
            if DROPPED_ELEMENTS.contains(&name) || is_signature_block(element) {
                return;
            }
            if name == "img" && is_tracking_pixel(element, tracking_hosts) {
                return;
            }
            out.push('<');
            out.push_str(name);
            for (attr_name, attr_value) in element.attrs() {
                out.push(' ');
                out.push_str(attr_name);
                out.push_str("=\"");
                push_escaped(out, attr_value);
                out.push('"');
            }
            out.push('>');
            if !VOID_ELEMENTS.contains(&name) {
                for child in node.children() {
                    emit(child, out, tracking_hosts);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
        Node::Text(text) => push_escaped(out, text),
        // Fragment/document wrappers, comments, doctypes.
        _ => {
            for child in node.children() {
                emit(child, out, tracking_hosts);
            }
        }
    }
}

fn is_signature_block(element: &Element) -> bool {
    let mut haystack = String::new();
    if let Some(class) = element.attr("class") {
        haystack.push_str(&class.to_ascii_lowercase());
        haystack.push(' ');
    }
    if let Some(id) = element.attr("id") {
        haystack.push_str(&id.to_ascii_lowercase());
    }
    if haystack.is_empty() {
        return false;
    }
    SIGNATURE_MARKERS
        .iter()
        .any(|marker| haystack.contains(marker))
}

fn is_tracking_pixel(element: &Element, tracking_hosts: &[String]) -> bool {
    let dimension = |name: &str| -> Option<f64> { element.attr(name)?.trim().parse().ok() };
    if let (Some(width), Some(height)) = (dimension("width"), dimension("height")) {
        if width <= 1.0 && height <= 1.0 {
            return true;
        }
    }
    if !tracking_hosts.is_empty() {
        if let Some(src) = element.attr("src") {
            let src = src.to_ascii_lowercase();
            return tracking_hosts
                .iter()
                .any(|host| !host.is_empty() && src.contains(&host.to_ascii_lowercase()));
        }
    }
    false
}

fn push_escaped(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_TRACKERS: &[String] = &[];

    #[test]
    fn test_signature_div_is_stripped() {
        let html = "<p>Hi</p><div class='signature'>-- Alice</div>";
        let text = html_to_text(html, NO_TRACKERS);
        assert_eq!(text.trim(), "Hi");
        assert!(!text.contains("Alice"));
    }

    #[test]
    fn test_signature_match_is_case_insensitive_on_id() {
        let html = "<p>Body</p><div id='Email-Signature'>sig</div><div class='DISCLAIMER'>law</div>";
        let text = html_to_text(html, NO_TRACKERS);
        assert!(text.contains("Body"));
        assert!(!text.contains("sig"));
        assert!(!text.contains("law"));
    }

    #[test]
    fn test_tracking_pixel_is_stripped() {
        let html = "<p>Visible text</p><img src='x' width='1' height='1'>";
        let text = html_to_text(html, NO_TRACKERS);
        assert!(text.contains("Visible text"));
        assert!(!sanitize(html, NO_TRACKERS).contains("<img"));
    }

    #[test]
    fn test_pixel_requires_both_dimensions_small() {
        let html = "<img src='banner.png' width='1' height='400'>";
        assert!(sanitize(html, NO_TRACKERS).contains("<img"));
    }

    #[test]
    fn test_tracking_host_pattern() {
        let hosts = vec!["track.example.net".to_string()];
        let html = "<p>Hello</p><img src='https://TRACK.example.net/o.gif' width='50' height='50'>";
        assert!(!sanitize(html, &hosts).contains("o.gif"));
        // Without the pattern the same image survives.
        assert!(sanitize(html, NO_TRACKERS).contains("o.gif"));
    }

    #[test]
    fn test_script_and_style_dropped() {
        let html = "<style>p{color:red}</style><p>Kept</p><script>alert(1)</script>";
        let text = html_to_text(html, NO_TRACKERS);
        assert_eq!(text.trim(), "Kept");
    }
}
