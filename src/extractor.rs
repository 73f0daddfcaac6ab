//! Ticket reference extraction from message subjects.
//!
//! A ticket reference is written as `#` followed by the ticket id, e.g. `#IM1234567`.
//! Candidates are pulled from the subject with [`candidates`] and only those the
//! ticketing system confirms as open survive [`extract`].
//!
//! ```
//! use mail_ticket_bridge::extractor::{candidates, strip_forward_prefix};
//!
//! let subject = strip_forward_prefix("Fw: #IM1001 and #IM1002 printer");
//! assert_eq!(subject, "#IM1001 and #IM1002 printer");
//! assert_eq!(candidates(subject), vec!["IM1001", "IM1002"]);
//! ```

use crate::ticketing::TicketSystem;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use tracing::{debug, instrument};

/// Prefix added by some clients when forwarding.
pub const FORWARD_PREFIX: &str = "Fw: ";

static TICKET_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([A-Za-z0-9_]+)").expect("valid regex"));

/// A ticket id confirmed open by the ticketing system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TicketReference(String);

impl TicketReference {
    /// The ticket id, without the leading `#`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the reference, returning the id.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TicketReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TicketReference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Removes one leading [`FORWARD_PREFIX`].
#[must_use]
pub fn strip_forward_prefix(subject: &str) -> &str {
    subject.strip_prefix(FORWARD_PREFIX).unwrap_or(subject)
}

/// Every `#id` token in the subject, in order of appearance, duplicates included.
#[must_use]
pub fn candidates(subject: &str) -> Vec<&str> {
    TICKET_TOKEN
        .captures_iter(subject)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .collect()
}

/// Extracts the ticket references of a subject that are open in the ticketing system.
///
/// Order of appearance is kept and so are duplicates; each occurrence is validated on
/// its own. Candidates the system rejects are dropped.
#[instrument(name = "extractor::extract", skip_all, fields(subject = %subject))]
pub async fn extract(subject: &str, tickets: &dyn TicketSystem) -> Vec<TicketReference> {
    let subject = strip_forward_prefix(subject);
    let mut references = Vec::new();

    for candidate in candidates(subject) {
        if tickets.ticket_exists(candidate).await {
            references.push(TicketReference(candidate.to_string()));
        } else {
            debug!(ticket_id = candidate, "Candidate is not an open ticket, skipping");
        }
    }

    debug!(count = references.len(), "Extracted ticket references");
    references
}
