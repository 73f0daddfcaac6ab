//! Parsing of raw RFC 822 messages into [`IncomingMessage`].

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use mailparse::{addrparse_header, parse_mail, DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

/// Subject used when a message carries none.
pub const DEFAULT_SUBJECT: &str = "No Subject";

static MARKUP_SNIFF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*/?\s*(html|head|body|div|p|br|table|span|font)\b").expect("valid regex")
});

/// A fetched message, reduced to what processing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Mailbox UID, used to delete exactly this message.
    pub uid: u32,
    /// Decoded subject, if the message has one.
    pub subject: Option<String>,
    /// Sender address.
    pub sender_address: String,
    /// Sender display name, if present.
    pub sender_name: Option<String>,
    /// `Message-ID` header, used for reply threading.
    pub message_id: Option<String>,
    /// `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// Decoded `text/plain` body.
    pub text: Option<String>,
    /// Decoded `text/html` body.
    pub html: Option<String>,
}

/// Body selected for forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContent<'a> {
    /// The raw body text.
    pub body: &'a str,
    /// Whether the body is markup and needs conversion to plain text.
    pub is_markup: bool,
}

impl IncomingMessage {
    /// Subject, or [`DEFAULT_SUBJECT`] when missing.
    #[must_use]
    pub fn subject_or_default(&self) -> &str {
        self.subject.as_deref().unwrap_or(DEFAULT_SUBJECT)
    }

    /// Name to greet the sender with: display name when present, address otherwise.
    #[must_use]
    pub fn greeting_name(&self) -> &str {
        self.sender_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.sender_address)
    }

    /// Picks the body to forward: the plain part when it has content, the HTML part
    /// otherwise. A plain part that is really an HTML document is flagged as markup.
    #[must_use]
    pub fn content(&self) -> Option<MessageContent<'_>> {
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            let is_markup = text.trim_start().starts_with('<') && MARKUP_SNIFF.is_match(text);
            return Some(MessageContent {
                body: text,
                is_markup,
            });
        }

        self.html
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .map(|html| MessageContent {
                body: html,
                is_markup: true,
            })
    }
}

/// Parses a raw message fetched under `uid`.
#[instrument(name = "parser::parse_incoming", skip(raw), fields(size = raw.len()))]
pub(crate) fn parse_incoming(raw: &[u8], uid: u32) -> Result<IncomingMessage> {
    let parsed = parse_mail(raw).map_err(|source| Error::ParseEmail { source })?;
    let headers = parsed.get_headers();

    let subject = headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    // Sender wins over From, the same precedence as the IMAP envelope
    let sender = headers
        .get_first_header("Sender")
        .and_then(|h| first_address(addrparse_header(h).ok()?))
        .or_else(|| {
            headers
                .get_first_header("From")
                .and_then(|h| first_address(addrparse_header(h).ok()?))
        });
    let Some((sender_address, sender_name)) = sender else {
        return Err(Error::ParseEmail {
            source: mailparse::MailParseError::Generic("message has no sender address"),
        });
    };

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let date = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    let mut bodies = Bodies::default();
    collect_bodies(&parsed, &mut bodies);

    debug!(
        uid,
        has_text = bodies.text.is_some(),
        has_html = bodies.html.is_some(),
        "Parsed message"
    );

    Ok(IncomingMessage {
        uid,
        subject,
        sender_address,
        sender_name,
        message_id,
        date,
        text: bodies.text,
        html: bodies.html,
    })
}

fn first_address(list: mailparse::MailAddrList) -> Option<(String, Option<String>)> {
    list.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some((info.addr.clone(), info.display_name.clone())),
        MailAddr::Group(group) => group
            .addrs
            .first()
            .map(|info| (info.addr.clone(), info.display_name.clone())),
    })
}

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
}

/// Walks the MIME tree keeping the first inline `text/plain` and `text/html` parts.
fn collect_bodies(part: &ParsedMail<'_>, bodies: &mut Bodies) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_bodies(sub, bodies);
        }
        return;
    }

    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return;
    }

    let slot = match part.ctype.mimetype.to_lowercase().as_str() {
        "text/plain" => &mut bodies.text,
        "text/html" => &mut bodies.html,
        _ => return,
    };

    if slot.is_none() {
        match part.get_body() {
            Ok(body) => *slot = Some(body),
            Err(e) => debug!(error = %e, mimetype = %part.ctype.mimetype, "Skipping undecodable part"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_plain() {
        let raw = b"From: Jane Doe <jane@example.com>\r\n\
Subject: Re: #IM1001 printer\r\n\
Message-ID: <abc@example.com>\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
\r\n\
The printer works again.";
        let msg = parse_incoming(raw, 42).unwrap();

        assert_eq!(msg.uid, 42);
        assert_eq!(msg.subject.as_deref(), Some("Re: #IM1001 printer"));
        assert_eq!(msg.sender_address, "jane@example.com");
        assert_eq!(msg.sender_name.as_deref(), Some("Jane Doe"));
        assert_eq!(msg.greeting_name(), "Jane Doe");
        assert_eq!(msg.message_id.as_deref(), Some("<abc@example.com>"));
        assert!(msg.date.is_some());

        let content = msg.content().unwrap();
        assert_eq!(content.body.trim(), "The printer works again.");
        assert!(!content.is_markup);
    }

    #[test]
    fn test_sender_header_takes_precedence() {
        let raw = b"From: list@example.com\r\nSender: owner@example.com\r\n\r\nbody";
        let msg = parse_incoming(raw, 1).unwrap();
        assert_eq!(msg.sender_address, "owner@example.com");
        assert_eq!(msg.greeting_name(), "owner@example.com");
    }

    #[test]
    fn test_missing_subject_defaults() {
        let raw = b"From: a@example.com\r\n\r\nbody";
        let msg = parse_incoming(raw, 1).unwrap();
        assert!(msg.subject.is_none());
        assert_eq!(msg.subject_or_default(), DEFAULT_SUBJECT);
    }

    #[test]
    fn test_missing_sender_is_parse_error() {
        let raw = b"Subject: hi\r\n\r\nbody";
        let result = parse_incoming(raw, 1);
        assert!(matches!(result, Err(Error::ParseEmail { .. })));
    }

    #[test]
    fn test_multipart_prefers_plain() {
        let raw = b"From: a@example.com\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain body\r\n\
--b1\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html body</p>\r\n\
--b1--\r\n";
        let msg = parse_incoming(raw, 7).unwrap();
        assert!(msg.html.as_deref().unwrap().contains("html body"));

        let content = msg.content().unwrap();
        assert!(content.body.contains("plain body"));
        assert!(!content.is_markup);
    }

    #[test]
    fn test_html_only_is_markup() {
        let raw = b"From: a@example.com\r\nContent-Type: text/html\r\n\r\n<p>Hello</p>";
        let msg = parse_incoming(raw, 1).unwrap();
        let content = msg.content().unwrap();
        assert!(content.is_markup);
    }

    #[test]
    fn test_attachment_text_is_ignored() {
        let raw = b"From: a@example.com\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
Content-Disposition: attachment; filename=\"log.txt\"\r\n\
\r\n\
attached log\r\n\
--b1--\r\n";
        let msg = parse_incoming(raw, 1).unwrap();
        assert!(msg.text.is_none());
        assert!(msg.content().is_none());
    }

    #[test]
    fn test_whitespace_body_has_no_content() {
        let raw = b"From: a@example.com\r\n\r\n   \r\n\r\n";
        let msg = parse_incoming(raw, 1).unwrap();
        assert!(msg.content().is_none());
    }

    #[test]
    fn test_plain_part_with_html_document_is_markup() {
        let msg = IncomingMessage {
            uid: 1,
            subject: None,
            sender_address: "a@example.com".into(),
            sender_name: None,
            message_id: None,
            date: None,
            text: Some("<html><body>Hi</body></html>".into()),
            html: None,
        };
        assert!(msg.content().unwrap().is_markup);

        let msg = IncomingMessage {
            text: Some("<see attached> thanks".into()),
            ..msg
        };
        assert!(!msg.content().unwrap().is_markup);
    }
}
