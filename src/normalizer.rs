//! Reduces a message body to the text worth appending to a ticket journal.
//!
//! Markup bodies are rendered to plain text first. The quoted history below the reply
//! delimiter is cut away, then quote markers, header-style lines and blank-line runs
//! are tidied up. Normalizing already-normalized text returns it unchanged.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

/// Delimiter that separates a reply from the message it quotes.
pub const REPLY_DELIMITER: &str = "----- Original message -----";

/// Column width used when rendering markup.
const RENDER_WIDTH: usize = 130;

const HEADER_KEYS: [&str; 5] = ["From", "To", "Cc", "Subject", "Date"];

static IMAGE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"));

static SELF_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a\s*>"#)
        .expect("valid regex")
});

static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

static QUOTE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[ \t]*>[ \t]?)+").expect("valid regex"));

static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Normalizes a message body.
///
/// `is_markup` selects HTML rendering before the text rules apply. The output is plain
/// text, so feeding it back with `is_markup = false` yields the same string.
#[must_use]
pub fn normalize(body: &str, is_markup: bool) -> String {
    let text = if is_markup {
        render_markup(body)
    } else {
        body.to_string()
    };

    let text = normalize_newlines(&text);
    let reply = split_reply(&text);
    clean(reply)
}

/// Renders markup to plain text, dropping images and inlining link targets.
///
/// A link reads `label [target]`, or just `label` when the label already is the target.
fn render_markup(html: &str) -> String {
    let html = IMAGE_TAG.replace_all(html, "");
    let html = SELF_LINK.replace_all(&html, |caps: &Captures<'_>| {
        let href = caps[1].trim();
        let label = ANY_TAG.replace_all(&caps[2], "");
        let label = label.trim();
        let target = href.strip_prefix("mailto:").unwrap_or(href);
        if label == href || label == target || target.is_empty() {
            label.to_string()
        } else {
            format!("{} [{}]", &caps[2], target.replace('<', "&lt;"))
        }
    });

    // No decorations: emphasis markers and link footnotes would end up in the journal
    let rendered =
        html2text::config::plain_no_decorate().string_from_read(html.as_bytes(), RENDER_WIDTH);
    match rendered {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to render markup, stripping tags instead");
            ANY_TAG.replace_all(&html, "").into_owned()
        }
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Keeps the reply part of a body.
///
/// Without a delimiter the whole text is the reply. When the text before the first
/// delimiter is only a quote marker, the reply is the segment after it.
fn split_reply(text: &str) -> &str {
    let mut parts = text.split(REPLY_DELIMITER);
    let first = parts.next().unwrap_or_default();
    match parts.next() {
        None => text,
        Some(second) if first.trim() == ">" => second,
        Some(_) => first,
    }
}

fn clean(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();

    for raw_line in text.lines() {
        let line = QUOTE_PREFIX.replace(raw_line, "");
        let line = line.trim_end();
        let unindented = line.trim_start();

        if header_at(unindented) {
            lines.extend(split_headers(unindented));
        } else {
            lines.push(line.to_string());
        }
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut iter = lines.into_iter().peekable();
    while let Some(line) = iter.next() {
        let is_date = line.starts_with("Date:");
        out.push(line);
        if is_date && iter.peek().is_some_and(|next| !next.is_empty()) {
            out.push(String::new());
        }
    }

    // Only blank lines are trimmed; indentation of the first line is content
    let joined = out.join("\n");
    BLANK_RUN
        .replace_all(&joined, "\n\n")
        .trim_matches('\n')
        .to_string()
}

/// Whether `rest` starts with a header key followed by a colon.
fn header_at(rest: &str) -> bool {
    HEADER_KEYS.iter().any(|key| {
        rest.strip_prefix(key)
            .is_some_and(|after| after.starts_with(':'))
    })
}

/// Byte offsets where a header starts: at the beginning of the line, or after
/// whitespace or a colon.
///
/// Formatting a segment only trims whitespace around its value and puts a space after
/// the key, so a segment never gains a new boundary. That keeps the split stable.
fn header_starts(line: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut at_boundary = true;
    for (offset, c) in line.char_indices() {
        if at_boundary && header_at(&line[offset..]) {
            starts.push(offset);
        }
        at_boundary = c.is_whitespace() || c == ':';
    }
    starts
}

/// Splits a run-on header line such as `From: a To: b` into one line per header,
/// each formatted as `Key: value`.
fn split_headers(line: &str) -> Vec<String> {
    let mut bounds = header_starts(line);
    if bounds.first() != Some(&0) {
        bounds.insert(0, 0);
    }
    bounds.push(line.len());

    bounds
        .windows(2)
        .map(|pair| format_header(&line[pair[0]..pair[1]]))
        .collect()
}

fn format_header(segment: &str) -> String {
    let segment = segment.trim();
    match segment.split_once(':') {
        Some((key, value)) if !value.trim().is_empty() => format!("{key}: {}", value.trim()),
        Some((key, _)) => format!("{key}:"),
        None => segment.to_string(),
    }
}
