//! Configuration for the mailbox listener, the ticketing client and the reply transport.
//!
//! Use [`BridgeConfigBuilder`] to create a configuration with sensible defaults:
//!
//! ```
//! use mail_ticket_bridge::BridgeConfig;
//!
//! let config = BridgeConfig::builder()
//!     .imap_host("imap.example.com")
//!     .imap_credentials("support@example.com", "app-password")
//!     .ticketing_host("sm.example.com")
//!     .ticketing_credentials("falcon", "secret")
//!     .smtp_host("smtp.example.com")
//!     .smtp_credentials("support@example.com", "app-password")
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.mailbox.port, 993);
//! ```
//!
//! In the binary the configuration is loaded once with [`BridgeConfig::from_env`] and is
//! immutable afterwards.

use crate::error::{Error, Result};
use email_address::EmailAddress;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Default IMAPS port.
pub const DEFAULT_IMAP_PORT: u16 = 993;
/// Default ticketing REST port.
pub const DEFAULT_TICKETING_PORT: u16 = 13080;
/// Default SMTP submission port.
pub const DEFAULT_SMTP_PORT: u16 = 587;
/// Default HTTP port for the manual trigger and health endpoints.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Complete process configuration.
///
/// Create using [`BridgeConfig::builder()`] or [`BridgeConfig::from_env()`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Mailbox (IMAP) settings.
    pub mailbox: MailboxConfig,
    /// Ticketing REST API settings.
    pub ticketing: TicketingConfig,
    /// Reply transport (SMTP) settings.
    pub smtp: SmtpConfig,
    /// Connection lifecycle tunables.
    pub listener: ListenerConfig,
    /// Per-command mailbox timeouts.
    pub timeouts: TimeoutConfig,
    /// Reply content and policy.
    pub notification: NotificationConfig,
    /// Port of the HTTP surface.
    pub http_port: u16,
}

/// IMAP server and account.
///
/// Note: The `password` field is stored as a [`SecretString`] to prevent
/// accidental logging of sensitive credentials.
#[derive(Clone)]
pub struct MailboxConfig {
    /// IMAP server hostname.
    pub host: String,
    /// IMAP server port (default: 993 for IMAPS).
    pub port: u16,
    /// Login user.
    pub user: String,
    password: SecretString,
    /// Folder to watch (default: `INBOX`).
    pub folder: String,
}

impl MailboxConfig {
    /// Returns the password as a string slice.
    ///
    /// The password is intentionally not directly accessible to prevent accidental logging.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns the full IMAP server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for MailboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("folder", &self.folder)
            .finish()
    }
}

/// Ticketing REST API endpoint and credentials.
#[derive(Clone)]
pub struct TicketingConfig {
    /// Ticketing host.
    pub host: String,
    /// Ticketing port.
    pub port: u16,
    /// Basic-auth user.
    pub username: String,
    password: SecretString,
    /// Path prefix of the REST resources (default: `/SM/9/rest`).
    pub base_path: String,
}

impl TicketingConfig {
    /// Returns the basic-auth password.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns the base URL of the REST API, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.host,
            self.port,
            self.base_path.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for TicketingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketingConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// SMTP relay used to send notification replies.
#[derive(Clone)]
pub struct SmtpConfig {
    /// SMTP relay host.
    pub host: String,
    /// SMTP port. Port 465 uses implicit TLS, anything else STARTTLS.
    pub port: u16,
    /// SMTP user.
    pub username: String,
    password: SecretString,
    /// Sender address of replies.
    pub from: EmailAddress,
    /// Sender display name of replies.
    pub from_name: String,
}

impl SmtpConfig {
    /// Returns the SMTP password.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Whether the connection starts with TLS instead of upgrading via STARTTLS.
    #[must_use]
    pub fn implicit_tls(&self) -> bool {
        self.port == 465
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from", &self.from.as_str())
            .field("from_name", &self.from_name)
            .finish()
    }
}

/// Connection lifecycle tunables.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Reconnection attempts before the listener gives up for good.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// IDLE is re-issued after this long even without a notification.
    pub idle_refresh_interval: Duration,
    /// Safety-net poll interval.
    pub poll_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(60),
            idle_refresh_interval: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Timeout configuration for mailbox operations.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for establishing TCP/TLS connection.
    pub connect: Duration,
    /// Timeout for IMAP authentication.
    pub auth: Duration,
    /// Timeout for selecting a mailbox.
    pub select: Duration,
    /// Timeout for fetch, store and expunge commands.
    pub command: Duration,
    /// Timeout for logout operation.
    pub logout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            auth: Duration::from_secs(30),
            select: Duration::from_secs(10),
            command: Duration::from_secs(30),
            logout: Duration::from_secs(5),
        }
    }
}

/// Reply content and policy.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Send a reply when a ticket update fails (default: off, log only).
    pub notify_on_update_failure: bool,
    /// Signature line of every reply.
    pub signature: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            notify_on_update_failure: false,
            signature: "SOC Support Team".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Loads the configuration from the process environment.
    ///
    /// A `.env` file in the working directory is read first if present.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value is malformed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value is malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(Error::MissingEnv { name })
        };

        let mut builder = Self::builder()
            .imap_host(required("IMAP_HOST")?)
            .imap_credentials(required("IMAP_USER")?, required("IMAP_PASSWORD")?)
            .ticketing_host(required("HPSM_HOST")?)
            .ticketing_credentials(required("HPSM_USERNAME")?, required("HPSM_PASSWORD")?)
            .smtp_host(required("SMTP_SERVER")?)
            .smtp_credentials(required("SMTP_USERNAME")?, required("SMTP_PASSWORD")?);

        if let Some(port) = parse_var::<u16>(&lookup, "IMAP_PORT")? {
            builder = builder.imap_port(port);
        }
        if let Some(folder) = lookup("IMAP_MAILBOX") {
            builder = builder.mailbox_folder(folder);
        }
        if let Some(port) = parse_var::<u16>(&lookup, "HPSM_PORT")? {
            builder = builder.ticketing_port(port);
        }
        if let Some(port) = parse_var::<u16>(&lookup, "SMTP_PORT")? {
            builder = builder.smtp_port(port);
        }
        if let Some(from) = lookup("SMTP_FROM") {
            builder = builder.smtp_from(from);
        }
        if let Some(name) = lookup("SMTP_FROM_NAME") {
            builder = builder.smtp_from_name(name);
        }
        if let Some(port) = parse_var::<u16>(&lookup, "PORT")? {
            builder = builder.http_port(port);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "LISTENER_MAX_RECONNECT_ATTEMPTS")? {
            builder = builder.max_reconnect_attempts(attempts);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LISTENER_RECONNECT_DELAY_SECS")? {
            builder = builder.reconnect_delay(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LISTENER_IDLE_REFRESH_SECS")? {
            builder = builder.idle_refresh_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LISTENER_POLL_INTERVAL_SECS")? {
            builder = builder.poll_interval(Duration::from_secs(secs));
        }
        if let Some(flag) = parse_var::<bool>(&lookup, "NOTIFY_ON_UPDATE_FAILURE")? {
            builder = builder.notify_on_update_failure(flag);
        }
        if let Some(signature) = lookup("NOTIFY_SIGNATURE") {
            builder = builder.signature(signature);
        }

        builder.build()
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig {
                message: format!("{name} has an invalid value: {raw}"),
            }),
    }
}

/// Validates an email address format.
fn validate_email(email: &str) -> Result<EmailAddress> {
    EmailAddress::parse_with_options(email, email_address::Options::default()).map_err(|_| {
        Error::InvalidEmailFormat {
            email: email.to_string(),
        }
    })
}

fn require(value: Option<String>, what: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::InvalidConfig {
            message: format!("{what} is required"),
        })
}

/// Builder for [`BridgeConfig`].
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    imap_host: Option<String>,
    imap_port: Option<u16>,
    imap_user: Option<String>,
    imap_password: Option<String>,
    folder: Option<String>,
    ticketing_host: Option<String>,
    ticketing_port: Option<u16>,
    ticketing_user: Option<String>,
    ticketing_password: Option<String>,
    ticketing_base_path: Option<String>,
    smtp_host: Option<String>,
    smtp_port: Option<u16>,
    smtp_user: Option<String>,
    smtp_password: Option<String>,
    smtp_from: Option<String>,
    smtp_from_name: Option<String>,
    listener: Option<ListenerConfig>,
    timeouts: Option<TimeoutConfig>,
    notification: Option<NotificationConfig>,
    http_port: Option<u16>,
}

impl BridgeConfigBuilder {
    /// Sets the IMAP server hostname (required).
    #[must_use]
    pub fn imap_host(mut self, host: impl Into<String>) -> Self {
        self.imap_host = Some(host.into());
        self
    }

    /// Sets the IMAP server port. Default is 993 (IMAPS with TLS).
    #[must_use]
    pub fn imap_port(mut self, port: u16) -> Self {
        self.imap_port = Some(port);
        self
    }

    /// Sets the IMAP login (required).
    #[must_use]
    pub fn imap_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.imap_user = Some(user.into());
        self.imap_password = Some(password.into());
        self
    }

    /// Sets the watched folder. Default is `INBOX`.
    #[must_use]
    pub fn mailbox_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Sets the ticketing host (required).
    #[must_use]
    pub fn ticketing_host(mut self, host: impl Into<String>) -> Self {
        self.ticketing_host = Some(host.into());
        self
    }

    /// Sets the ticketing port.
    #[must_use]
    pub fn ticketing_port(mut self, port: u16) -> Self {
        self.ticketing_port = Some(port);
        self
    }

    /// Sets the ticketing basic-auth credentials (required).
    #[must_use]
    pub fn ticketing_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.ticketing_user = Some(user.into());
        self.ticketing_password = Some(password.into());
        self
    }

    /// Sets the REST path prefix. Default is `/SM/9/rest`.
    #[must_use]
    pub fn ticketing_base_path(mut self, path: impl Into<String>) -> Self {
        self.ticketing_base_path = Some(path.into());
        self
    }

    /// Sets the SMTP relay host (required).
    #[must_use]
    pub fn smtp_host(mut self, host: impl Into<String>) -> Self {
        self.smtp_host = Some(host.into());
        self
    }

    /// Sets the SMTP port.
    #[must_use]
    pub fn smtp_port(mut self, port: u16) -> Self {
        self.smtp_port = Some(port);
        self
    }

    /// Sets the SMTP login.
    #[must_use]
    pub fn smtp_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.smtp_user = Some(user.into());
        self.smtp_password = Some(password.into());
        self
    }

    /// Sets the reply sender address. Defaults to the SMTP user, then the IMAP user.
    #[must_use]
    pub fn smtp_from(mut self, from: impl Into<String>) -> Self {
        self.smtp_from = Some(from.into());
        self
    }

    /// Sets the reply sender display name.
    #[must_use]
    pub fn smtp_from_name(mut self, name: impl Into<String>) -> Self {
        self.smtp_from_name = Some(name.into());
        self
    }

    /// Sets the whole lifecycle configuration.
    #[must_use]
    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the reconnection attempt cap.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.listener
            .get_or_insert_with(ListenerConfig::default)
            .max_reconnect_attempts = attempts;
        self
    }

    /// Sets the fixed delay between reconnection attempts.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.listener
            .get_or_insert_with(ListenerConfig::default)
            .reconnect_delay = delay;
        self
    }

    /// Sets the IDLE refresh interval.
    #[must_use]
    pub fn idle_refresh_interval(mut self, interval: Duration) -> Self {
        self.listener
            .get_or_insert_with(ListenerConfig::default)
            .idle_refresh_interval = interval;
        self
    }

    /// Sets the safety-net poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.listener
            .get_or_insert_with(ListenerConfig::default)
            .poll_interval = interval;
        self
    }

    /// Sets timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .connect = timeout;
        self
    }

    /// Enables or disables replies on failed ticket updates.
    #[must_use]
    pub fn notify_on_update_failure(mut self, enabled: bool) -> Self {
        self.notification
            .get_or_insert_with(NotificationConfig::default)
            .notify_on_update_failure = enabled;
        self
    }

    /// Sets the reply signature.
    #[must_use]
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.notification
            .get_or_insert_with(NotificationConfig::default)
            .signature = signature.into();
        self
    }

    /// Sets the HTTP surface port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<BridgeConfig> {
        let imap_user = require(self.imap_user, "IMAP user")?;
        let smtp_user = self.smtp_user.unwrap_or_default();

        // Reply sender: explicit > SMTP user > IMAP user
        let from_raw = self
            .smtp_from
            .or_else(|| Some(smtp_user.clone()).filter(|u| u.contains('@')))
            .unwrap_or_else(|| imap_user.clone());
        let from = validate_email(&from_raw)?;

        let listener = self.listener.unwrap_or_default();
        if listener.idle_refresh_interval.is_zero() || listener.poll_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "idle refresh and poll intervals must be non-zero".into(),
            });
        }

        Ok(BridgeConfig {
            mailbox: MailboxConfig {
                host: require(self.imap_host, "IMAP host")?,
                port: self.imap_port.unwrap_or(DEFAULT_IMAP_PORT),
                user: imap_user,
                password: SecretString::from(require(self.imap_password, "IMAP password")?),
                folder: self.folder.unwrap_or_else(|| "INBOX".to_string()),
            },
            ticketing: TicketingConfig {
                host: require(self.ticketing_host, "ticketing host")?,
                port: self.ticketing_port.unwrap_or(DEFAULT_TICKETING_PORT),
                username: require(self.ticketing_user, "ticketing user")?,
                password: SecretString::from(require(
                    self.ticketing_password,
                    "ticketing password",
                )?),
                base_path: self
                    .ticketing_base_path
                    .unwrap_or_else(|| "/SM/9/rest".to_string()),
            },
            smtp: SmtpConfig {
                host: require(self.smtp_host, "SMTP host")?,
                port: self.smtp_port.unwrap_or(DEFAULT_SMTP_PORT),
                username: smtp_user,
                password: SecretString::from(self.smtp_password.unwrap_or_default()),
                from,
                from_name: self
                    .smtp_from_name
                    .unwrap_or_else(|| "Attachment Email Parser".to_string()),
            },
            listener,
            timeouts: self.timeouts.unwrap_or_default(),
            notification: self.notification.unwrap_or_default(),
            http_port: self.http_port.unwrap_or(DEFAULT_HTTP_PORT),
        })
    }
}
