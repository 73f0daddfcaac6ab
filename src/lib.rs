//! # mail-ticket-bridge
//!
//! Watches an IMAP mailbox and turns replies into journal updates on a ticketing system.
//!
//! The newest message of the watched folder is processed whenever the server pushes new
//! mail (IMAP IDLE), the IDLE session is refreshed, the poll timer fires or a manual
//! check is requested over HTTP. Processing a message means:
//!
//! 1. normalize its body (HTML to text, quoted history and reply chains cut off)
//! 2. extract `#ID` ticket references from the subject and keep the open ones
//! 3. append the body to each ticket's journal
//! 4. delete the message once a ticket accepted it, or reply to the sender explaining
//!    why nothing could be forwarded
//!
//! At most one pass runs at a time; triggers arriving meanwhile are dropped.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mail_ticket_bridge::{spawn_listener, BridgeConfig, ConnectionState};
//!
//! # async fn example() -> mail_ticket_bridge::Result<()> {
//! let config = BridgeConfig::builder()
//!     .imap_host("imap.example.com")
//!     .imap_credentials("desk@example.com", "app-password")
//!     .ticketing_host("sm.example.com")
//!     .ticketing_credentials("falcon", "secret")
//!     .smtp_host("smtp.example.com")
//!     .smtp_credentials("desk@example.com", "app-password")
//!     .build()?;
//!
//! let mut handle = spawn_listener(&config)?;
//! handle.wait_for(|state| *state == ConnectionState::Idle).await;
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Use [`Error::category`] and [`Error::is_retryable`] to classify failures:
//!
//! ```
//! use mail_ticket_bridge::{Error, ErrorCategory};
//!
//! fn fatal(error: &Error) -> bool {
//!     error.category() == ErrorCategory::CapacityExhausted
//! }
//! ```
//!
//! ## Observability
//!
//! All I/O is instrumented with `tracing` spans.
//!
//! ### Span Naming Convention
//!
//! - `listener::run` - Connection lifecycle
//! - `processor::run_pass` - One processing pass
//! - `connection::establish_tls` - TLS connection
//! - `session::authenticate` - IMAP authentication
//! - `session::idle_wait` - IMAP IDLE
//! - `ticketing::query_open` / `ticketing::put_journal` - Ticketing API calls
//! - `notifier::send_reply` - SMTP delivery
//!
//! ### Standard Fields
//!
//! - `imap_host`, `user` - Mailbox account
//! - `uid` - Message UID
//! - `ticket_id` - Ticket reference
//! - `trigger` - What started a pass
//! - `attempt` - Reconnect attempt

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod api;
pub mod config;
pub mod error;
pub mod extractor;
pub mod listener;
pub mod mailbox;
pub mod normalizer;
pub mod notifier;
pub mod parser;
pub mod processor;
pub mod session;
pub mod ticketing;
pub mod trigger;

// Internal modules
mod connection;

#[cfg(test)]
mod testing;

// Re-exports for ergonomic API
pub use api::{ApiResponse, ListenerSupervisor, ManualOutcome, RateLimitConfig};
pub use config::{
    BridgeConfig, BridgeConfigBuilder, ListenerConfig, MailboxConfig, NotificationConfig,
    SmtpConfig, TicketingConfig, TimeoutConfig,
};
pub use email_address::EmailAddress;
pub use error::{Error, ErrorCategory, Result};
pub use extractor::TicketReference;
pub use listener::{ConnectionState, Listener, ListenerHandle};
pub use mailbox::{MailboxConnector, MailboxSession};
pub use notifier::{MailTransport, Notice, Reply, SmtpMailer};
pub use parser::IncomingMessage;
pub use processor::{MessageProcessor, PassOutcome, PassReport};
pub use session::ImapConnector;
pub use ticketing::{HpsmClient, TicketSystem, TicketUpdateOutcome};
pub use trigger::Trigger;

use std::sync::Arc;
use tracing::{error, info};

/// Builds the production listener for `config` and spawns it on the current runtime.
///
/// # Errors
///
/// Returns an error if the ticketing or SMTP client cannot be built.
pub fn spawn_listener(config: &BridgeConfig) -> Result<ListenerHandle> {
    let connector = ImapConnector::new(config.mailbox.clone(), config.timeouts.clone());
    let tickets = HpsmClient::new(&config.ticketing)?;
    let mailer = SmtpMailer::new(&config.smtp)?;
    let processor = MessageProcessor::new(
        Arc::new(tickets),
        Arc::new(mailer),
        config.notification.clone(),
    );

    let (listener, handle) = Listener::new(connector, processor, config.listener.clone());

    tokio::spawn(async move {
        match listener.run().await {
            Ok(()) => info!("Mail listener exited"),
            Err(e) => error!(error = %e, category = %e.category(), "Mail listener stopped"),
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        // Ensure all public types are accessible
        let _ = BridgeConfig::builder();
        let _ = ListenerConfig::default();
        let _ = TimeoutConfig::default();
        let _ = NotificationConfig::default();
        let _ = trigger::channel();
        assert_eq!(normalizer::normalize("hi", false), "hi");
    }
}
