//! Ticketing system access.
//!
//! [`TicketSystem`] is the seam the processor talks to; [`HpsmClient`] implements it
//! against the incident REST API. Both operations report failure as values: a ticket
//! that cannot be queried does not exist as far as processing is concerned, and a
//! failed update becomes an unsuccessful [`TicketUpdateOutcome`].

use crate::config::TicketingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Per-request timeout for existence queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for journal updates.
const UPDATE_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of one journal update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketUpdateOutcome {
    /// The ticket that was updated.
    pub ticket_id: String,
    /// Whether the journal entry was stored.
    pub success: bool,
    /// Human-readable detail for logs and failure notices.
    pub detail: String,
}

impl TicketUpdateOutcome {
    /// A successful update.
    #[must_use]
    pub fn succeeded(ticket_id: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            success: true,
            detail: "ticket updated successfully".to_string(),
        }
    }

    /// A failed update with the reason.
    #[must_use]
    pub fn failed(ticket_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            success: false,
            detail: detail.into(),
        }
    }
}

/// Operations the processor needs from a ticketing system.
#[async_trait]
pub trait TicketSystem: Send + Sync {
    /// Whether `ticket_id` names an existing ticket that is neither resolved nor closed.
    async fn ticket_exists(&self, ticket_id: &str) -> bool;

    /// Appends `content` to the journal of `ticket_id`.
    async fn update_journal(&self, ticket_id: &str, content: &str) -> TicketUpdateOutcome;
}

/// Query answer of the incident collection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentQuery {
    /// Number of matching incidents.
    #[serde(rename = "@count", default)]
    pub count: u64,
    /// Matching rows, as returned by the server.
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JournalUpdate<'a> {
    #[serde(rename = "Incident")]
    incident: JournalEntry<'a>,
}

#[derive(Debug, Serialize)]
struct JournalEntry<'a> {
    #[serde(rename = "JournalUpdates")]
    journal_updates: &'a str,
}

/// REST client for the incident API.
pub struct HpsmClient {
    client: Client,
    base_url: String,
    username: String,
    password: SecretString,
}

impl HpsmClient {
    /// Creates a client for the configured endpoint.
    pub fn new(config: &TicketingConfig) -> Result<Self> {
        Self::with_base_url(config.base_url(), &config.username, config.password())
    }

    /// Creates a client for an explicit base URL such as `http://sm:13080/SM/9/rest`.
    pub fn with_base_url(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: SecretString::from(password.into()),
        })
    }

    /// Queries open incidents with the given id.
    #[instrument(name = "ticketing::query_open", skip(self))]
    pub async fn query_open(&self, ticket_id: &str) -> Result<IncidentQuery> {
        let filter = open_incident_filter(ticket_id);
        let url = format!(
            "{}/incidents?query={}",
            self.base_url,
            urlencoding::encode(&filter)
        );

        debug!("Querying ticketing system");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|source| Error::TicketingRequest {
                ticket_id: ticket_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => response
                .json::<IncidentQuery>()
                .await
                .map_err(|source| Error::TicketingRequest {
                    ticket_id: ticket_id.to_string(),
                    source,
                }),
            // Some deployments answer an empty query with 404
            StatusCode::NOT_FOUND => Ok(IncidentQuery::default()),
            status => Err(Error::TicketingStatus {
                ticket_id: ticket_id.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Stores a journal entry on an incident.
    #[instrument(name = "ticketing::put_journal", skip(self, content), fields(content_len = content.len()))]
    pub async fn put_journal(&self, ticket_id: &str, content: &str) -> Result<()> {
        let url = format!(
            "{}/incidents/{}",
            self.base_url,
            urlencoding::encode(ticket_id)
        );
        let body = JournalUpdate {
            incident: JournalEntry {
                journal_updates: content,
            },
        };

        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .json(&body)
            .timeout(UPDATE_TIMEOUT)
            .send()
            .await
            .map_err(|source| Error::TicketingRequest {
                ticket_id: ticket_id.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Error::TicketingStatus {
            ticket_id: ticket_id.to_string(),
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn try_update(&self, ticket_id: &str, content: &str) -> Result<()> {
        if !self.ticket_exists(ticket_id).await {
            return Err(Error::TicketNotOpen {
                ticket_id: ticket_id.to_string(),
            });
        }
        self.put_journal(ticket_id, content).await
    }
}

#[async_trait]
impl TicketSystem for HpsmClient {
    async fn ticket_exists(&self, ticket_id: &str) -> bool {
        if !is_ticket_id(ticket_id) {
            debug!(ticket_id, "Rejecting malformed ticket id");
            return false;
        }

        match self.query_open(ticket_id).await {
            Ok(answer) => answer.count > 0,
            Err(e) => {
                warn!(ticket_id, error = %e, "Ticket lookup failed, treating as absent");
                false
            }
        }
    }

    async fn update_journal(&self, ticket_id: &str, content: &str) -> TicketUpdateOutcome {
        match self.try_update(ticket_id, content).await {
            Ok(()) => {
                info!(ticket_id, "Ticket journal updated");
                TicketUpdateOutcome::succeeded(ticket_id)
            }
            Err(e) => {
                warn!(ticket_id, error = %e, category = %e.category(), "Ticket update failed");
                TicketUpdateOutcome::failed(ticket_id, e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for HpsmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpsmClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Filter selecting the incident only while it is neither resolved nor closed.
fn open_incident_filter(ticket_id: &str) -> String {
    format!(r#"IncidentID="{ticket_id}" and not (StatusIM="Resolved" or StatusIM="Closed")"#)
}

fn is_ticket_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
