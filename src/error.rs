//! Error types for the mail-ticket-bridge crate.
//!
//! All errors implement [`std::error::Error`] and provide context about what went wrong.
//! Errors are categorized by retryability (see [`Error::is_retryable`]) and by whether
//! they mean the mailbox session is gone (see [`Error::is_connection_lost`]).

use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bridging mail to the ticketing system.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid email address format.
    #[error("invalid email format: {email}")]
    InvalidEmailFormat {
        /// The invalid email address.
        email: String,
    },

    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// A required environment variable is missing.
    #[error("missing environment variable {name}")]
    MissingEnv {
        /// Name of the variable.
        name: &'static str,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Mailbox network errors (RETRYABLE, connection lost)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish TCP connection.
    #[error("failed to connect to {target}")]
    TcpConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to establish TLS connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The mailbox session is no longer usable (closed by the server or lost during IDLE).
    #[error("mailbox session closed")]
    SessionClosed,

    // ─────────────────────────────────────────────────────────────────────────
    // Mailbox timeouts (RETRYABLE)
    // ─────────────────────────────────────────────────────────────────────────
    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Authentication timeout.
    #[error("authentication timeout for {user} after {timeout:?}")]
    AuthTimeout {
        /// The mailbox user.
        user: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Mailbox selection timeout.
    #[error("mailbox selection timeout for '{mailbox}' after {timeout:?}")]
    SelectTimeout {
        /// The mailbox name.
        mailbox: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Message fetch or delete timeout.
    #[error("mailbox command '{command}' timed out after {timeout:?}")]
    CommandTimeout {
        /// The IMAP command that timed out.
        command: &'static str,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Logout timeout (not critical).
    #[error("logout timeout after {timeout:?}")]
    LogoutTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IMAP protocol errors (RETRYABLE, connection lost)
    // ─────────────────────────────────────────────────────────────────────────
    /// IMAP login failed.
    #[error("IMAP login failed for {user}")]
    ImapLogin {
        /// The user name used for login.
        user: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to select mailbox.
    #[error("failed to select mailbox '{mailbox}'")]
    SelectMailbox {
        /// The mailbox name.
        mailbox: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP fetch failed.
    #[error("IMAP fetch failed for {sequence}")]
    ImapFetch {
        /// The sequence set that failed.
        sequence: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to fetch message from stream.
    #[error("failed to fetch message from stream")]
    FetchMessage {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP STORE (flag update) failed.
    #[error("IMAP store failed for {sequence}")]
    ImapStore {
        /// The sequence set that failed.
        sequence: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP EXPUNGE failed.
    #[error("IMAP expunge failed")]
    ImapExpunge {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP IDLE failed.
    #[error("IMAP IDLE failed")]
    ImapIdle {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Email parsing errors (NOT retryable - malformed content won't change)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to parse email message.
    #[error("failed to parse email")]
    ParseEmail {
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Ticketing errors (RETRYABLE transport, NOT retryable validation)
    // ─────────────────────────────────────────────────────────────────────────
    /// Request to the ticketing system failed at the transport level.
    #[error("ticketing request for {ticket_id} failed")]
    TicketingRequest {
        /// The ticket being queried or updated.
        ticket_id: String,
        /// The underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },

    /// The ticketing system answered with a non-success status.
    #[error("ticketing system returned HTTP {status} for {ticket_id}: {body}")]
    TicketingStatus {
        /// The ticket being queried or updated.
        ticket_id: String,
        /// The HTTP status code.
        status: u16,
        /// Response body, if any.
        body: String,
    },

    /// The ticket is resolved, closed, or does not exist.
    #[error("ticket {ticket_id} is resolved, closed, or invalid")]
    TicketNotOpen {
        /// The ticket identifier.
        ticket_id: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound mail errors (RETRYABLE transport)
    // ─────────────────────────────────────────────────────────────────────────
    /// An address could not be used as a mailbox.
    #[error("invalid mail address '{address}'")]
    InvalidAddress {
        /// The offending address.
        address: String,
        /// The underlying address error.
        #[source]
        source: lettre::address::AddressError,
    },

    /// The reply message could not be assembled.
    #[error("failed to build reply message")]
    BuildMessage {
        /// The underlying builder error.
        #[source]
        source: lettre::error::Error,
    },

    /// The SMTP transport rejected or failed to deliver the reply.
    #[error("failed to send reply to {to}")]
    SmtpSend {
        /// The recipient.
        to: String,
        /// The underlying SMTP error.
        #[source]
        source: lettre::transport::smtp::Error,
    },

    /// The SMTP transport could not be created.
    #[error("failed to create SMTP transport for {host}")]
    SmtpTransport {
        /// The SMTP relay host.
        host: String,
        /// The underlying SMTP error.
        #[source]
        source: lettre::transport::smtp::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Listener errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Reconnection attempts are exhausted; the listener is permanently failed.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of reconnection attempts made.
        attempts: u32,
    },

    /// The HTTP surface could not bind its listening socket.
    #[error("failed to bind HTTP listener on {addr}")]
    HttpBind {
        /// The address that failed.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP surface stopped with an I/O error.
    #[error("HTTP server failed")]
    HttpServe {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Protocol
        ) && !matches!(self, Error::LogoutTimeout { .. } | Error::ImapLogout { .. })
    }

    /// Returns `true` if the mailbox session can no longer be used after this error.
    ///
    /// The listener reconnects when a pass or an idle-wait fails with such an error.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::TcpConnect { .. }
                | Error::TlsConnect { .. }
                | Error::SessionClosed
                | Error::ConnectTimeout { .. }
                | Error::AuthTimeout { .. }
                | Error::SelectTimeout { .. }
                | Error::CommandTimeout { .. }
                | Error::ImapLogin { .. }
                | Error::SelectMailbox { .. }
                | Error::ImapFetch { .. }
                | Error::FetchMessage { .. }
                | Error::ImapStore { .. }
                | Error::ImapExpunge { .. }
                | Error::ImapIdle { .. }
        )
    }

    /// Returns the error category for metrics/logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidEmailFormat { .. }
            | Error::InvalidConfig { .. }
            | Error::MissingEnv { .. }
            | Error::InvalidDnsName { .. }
            | Error::InvalidAddress { .. }
            | Error::SmtpTransport { .. }
            | Error::HttpBind { .. } => ErrorCategory::Configuration,

            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::SessionClosed
            | Error::TicketingRequest { .. }
            | Error::SmtpSend { .. }
            | Error::HttpServe { .. } => ErrorCategory::Network,

            Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::CommandTimeout { .. }
            | Error::LogoutTimeout { .. } => ErrorCategory::Timeout,

            Error::ImapLogin { .. }
            | Error::SelectMailbox { .. }
            | Error::ImapFetch { .. }
            | Error::FetchMessage { .. }
            | Error::ImapStore { .. }
            | Error::ImapExpunge { .. }
            | Error::ImapIdle { .. }
            | Error::ImapLogout { .. }
            | Error::TicketingStatus { .. } => ErrorCategory::Protocol,

            Error::ParseEmail { .. } | Error::BuildMessage { .. } => ErrorCategory::Parse,

            Error::TicketNotOpen { .. } => ErrorCategory::Validation,

            Error::ReconnectExhausted { .. } => ErrorCategory::CapacityExhausted,
        }
    }
}

/// Error categories for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or validation errors in the process setup.
    Configuration,
    /// Network connectivity errors.
    Network,
    /// Timeout errors.
    Timeout,
    /// IMAP or HTTP protocol errors.
    Protocol,
    /// Email parsing or composition errors.
    Parse,
    /// Expected rejections of user input (ticket not open).
    Validation,
    /// The listener ran out of reconnection attempts.
    CapacityExhausted,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Parse => write!(f, "parse"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::CapacityExhausted => write!(f, "capacity_exhausted"),
        }
    }
}
