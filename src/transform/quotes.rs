//! Quote collapsing for reply chains.

/// Replacement emitted for each run of deeply nested quoted lines.
pub const QUOTE_COLLAPSE_MARKER: &str = "[Quoted text collapsed]";

/// Depth at which quoted lines stop being worth their tokens.
const COLLAPSE_DEPTH: usize = 3;

/// Collapse every run of lines quoted at depth >= 3 into a single marker
/// line. Depth 1 and 2 quotes carry recent context and are preserved.
pub fn collapse_quotes(body: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_collapsed_run = false;
    for line in body.lines() {
        if quote_depth(line) >= COLLAPSE_DEPTH {
            if !in_collapsed_run {
                out.push(QUOTE_COLLAPSE_MARKER);
                in_collapsed_run = true;
            }
            continue;
        }
        in_collapsed_run = false;
        out.push(line);
    }
    out.join("\n")
}

/// Count of leading `>` markers; spaces between markers are tolerated
/// ("> > >" quotes at depth 3 just like ">>>").
fn quote_depth(line: &str) -> usize {
    if !line.starts_with('>') {
        return 0;
    }
    let mut depth = 0;
    for ch in line.chars() {
        match ch {
            '>' => depth += 1,
            ' ' => continue,
            _ => break,
        }
    }
    depth
}
