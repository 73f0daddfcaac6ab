//! IMAP mailbox sessions.
//!
//! Thin wrappers around async-imap commands with error mapping, plus [`ImapConnector`]
//! and [`ImapMailbox`], the IMAP implementations of the mailbox traits.

use crate::config::{MailboxConfig, TimeoutConfig};
use crate::connection::{self, TlsStream};
use crate::error::{Error, Result};
use crate::mailbox::{MailboxConnector, MailboxSession, Wake};
use crate::parser::{self, IncomingMessage};
use crate::trigger::TriggerReceiver;
use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Fetch;
use async_imap::Session;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Type alias for IMAP session over TLS.
pub(crate) type ImapSession = Session<TlsStream>;

/// Authenticates to IMAP server and returns a session.
#[instrument(name = "session::authenticate", skip_all, fields(user = %user))]
pub(crate) async fn authenticate(
    tls_stream: TlsStream,
    user: &str,
    password: &str,
) -> Result<ImapSession> {
    let client = async_imap::Client::new(tls_stream);

    debug!("Authenticating to IMAP server");

    client
        .login(user, password)
        .await
        .map_err(|e| Error::ImapLogin {
            user: user.to_string(),
            source: e.0,
        })
}

/// Selects a folder and returns its message count.
#[instrument(name = "session::select", skip(session), fields(mailbox = %mailbox))]
pub(crate) async fn select_mailbox(session: &mut ImapSession, mailbox: &str) -> Result<u32> {
    let selected = session
        .select(mailbox)
        .await
        .map_err(|source| Error::SelectMailbox {
            mailbox: mailbox.to_string(),
            source,
        })?;

    debug!(exists = selected.exists, "Mailbox selected");
    Ok(selected.exists)
}

/// Fetches UID and full body of the message at sequence number `seq`.
#[instrument(name = "session::fetch_message", skip(session))]
pub(crate) async fn fetch_message(
    session: &mut ImapSession,
    seq: u32,
) -> Result<Option<(u32, Vec<u8>)>> {
    let sequence = seq.to_string();
    let fetches: Vec<Fetch> = session
        .fetch(&sequence, "(UID BODY.PEEK[])")
        .await
        .map_err(|source| Error::ImapFetch {
            sequence: sequence.clone(),
            source,
        })?
        .try_collect()
        .await
        .map_err(|source| Error::FetchMessage { source })?;

    let found = fetches.iter().find_map(|fetch| {
        let uid = fetch.uid?;
        let body = fetch.body()?;
        Some((uid, body.to_vec()))
    });

    if found.is_none() {
        debug!(responses = fetches.len(), "Fetch returned no body");
    }

    Ok(found)
}

/// Flags the message with `uid` as deleted and expunges the folder.
#[instrument(name = "session::delete_uid", skip(session))]
pub(crate) async fn delete_uid(session: &mut ImapSession, uid: u32) -> Result<()> {
    let sequence = uid.to_string();

    let _: Vec<Fetch> = session
        .uid_store(&sequence, "+FLAGS (\\Deleted)")
        .await
        .map_err(|source| Error::ImapStore {
            sequence: sequence.clone(),
            source,
        })?
        .try_collect()
        .await
        .map_err(|source| Error::ImapStore {
            sequence: sequence.clone(),
            source,
        })?;

    // UID EXPUNGE (UIDPLUS) leaves messages flagged by other clients alone
    let by_uid: Option<Vec<u32>> = match session.uid_expunge(&sequence).await {
        Ok(stream) => Some(
            stream
                .try_collect()
                .await
                .map_err(|source| Error::ImapExpunge { source })?,
        ),
        Err(async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_)) => None,
        Err(source) => return Err(Error::ImapExpunge { source }),
    };

    let expunged = match by_uid {
        Some(uids) => uids,
        None => {
            debug!("UID EXPUNGE rejected, falling back to EXPUNGE");
            session
                .expunge()
                .await
                .map_err(|source| Error::ImapExpunge { source })?
                .try_collect()
                .await
                .map_err(|source| Error::ImapExpunge { source })?
        }
    };

    debug!(expunged = expunged.len(), "Message deleted");
    Ok(())
}

/// Logs out from IMAP session.
#[instrument(name = "session::logout", skip(session))]
pub(crate) async fn logout(session: &mut ImapSession) -> Result<()> {
    debug!("Logging out");

    session
        .logout()
        .await
        .map_err(|source| Error::ImapLogout { source })?;

    Ok(())
}

/// Opens [`ImapMailbox`] sessions for a configured account.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: MailboxConfig,
    timeouts: TimeoutConfig,
}

impl ImapConnector {
    /// Creates a connector.
    #[must_use]
    pub fn new(config: MailboxConfig, timeouts: TimeoutConfig) -> Self {
        Self { config, timeouts }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    #[instrument(
        name = "session::connect",
        skip_all,
        fields(imap_host = %self.config.host, user = %self.config.user)
    )]
    async fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        let config = &self.config;
        let timeouts = &self.timeouts;

        let tls_stream = tokio::time::timeout(
            timeouts.connect,
            connection::establish_tls_connection(config),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: config.server_address(),
            timeout: timeouts.connect,
        })??;

        debug!("TLS connection established");

        let mut session = tokio::time::timeout(
            timeouts.auth,
            authenticate(tls_stream, &config.user, config.password()),
        )
        .await
        .map_err(|_| Error::AuthTimeout {
            user: config.user.clone(),
            timeout: timeouts.auth,
        })??;

        let exists = tokio::time::timeout(
            timeouts.select,
            select_mailbox(&mut session, &config.folder),
        )
        .await
        .map_err(|_| Error::SelectTimeout {
            mailbox: config.folder.clone(),
            timeout: timeouts.select,
        })??;

        info!(folder = %config.folder, exists, "Connected to mailbox");

        Ok(Box::new(ImapMailbox {
            session: Some(session),
            folder: config.folder.clone(),
            timeouts: timeouts.clone(),
            exists,
            locked: false,
        }))
    }
}

/// An authenticated IMAP session with the folder selected.
pub struct ImapMailbox {
    // Taken while IDLE owns the connection
    session: Option<ImapSession>,
    folder: String,
    timeouts: TimeoutConfig,
    exists: u32,
    locked: bool,
}

impl ImapMailbox {
    fn session(&mut self) -> Result<&mut ImapSession> {
        self.session.as_mut().ok_or(Error::SessionClosed)
    }
}

#[async_trait]
impl MailboxSession for ImapMailbox {
    async fn lock(&mut self) -> Result<()> {
        let timeout = self.timeouts.select;
        let folder = self.folder.clone();
        let session = self.session()?;

        // Reselecting refreshes the message count seen during IDLE
        let exists = tokio::time::timeout(timeout, select_mailbox(session, &folder))
            .await
            .map_err(|_| Error::SelectTimeout {
                mailbox: folder.clone(),
                timeout,
            })??;

        self.exists = exists;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) {
        self.locked = false;
    }

    async fn fetch_newest(&mut self) -> Result<Option<IncomingMessage>> {
        debug_assert!(self.locked, "fetch outside of a mailbox lock");
        if self.exists == 0 {
            debug!("Mailbox is empty");
            return Ok(None);
        }

        let timeout = self.timeouts.command;
        let newest = self.exists;
        let session = self.session()?;

        let fetched = tokio::time::timeout(timeout, fetch_message(session, newest))
            .await
            .map_err(|_| Error::CommandTimeout {
                command: "FETCH",
                timeout,
            })??;

        match fetched {
            Some((uid, raw)) => parser::parse_incoming(&raw, uid).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&mut self, uid: u32) -> Result<()> {
        debug_assert!(self.locked, "delete outside of a mailbox lock");
        let timeout = self.timeouts.command;
        let session = self.session()?;

        tokio::time::timeout(timeout, delete_uid(session, uid))
            .await
            .map_err(|_| Error::CommandTimeout {
                command: "STORE",
                timeout,
            })?
    }

    #[instrument(name = "session::idle_wait", skip_all, fields(refresh_secs = refresh.as_secs()))]
    async fn idle_wait(
        &mut self,
        refresh: Duration,
        triggers: &mut TriggerReceiver,
    ) -> Result<Wake> {
        let session = self.session.take().ok_or(Error::SessionClosed)?;
        let mut idle = session.idle();

        if let Err(source) = idle.init().await {
            warn!(error = %source, "Failed to enter IDLE");
            if let Ok(session) = idle.done().await {
                self.session = Some(session);
            }
            return Err(Error::ImapIdle { source });
        }

        debug!("Waiting in IDLE");

        let outcome = {
            let (idle_future, stop_source) = idle.wait();
            tokio::select! {
                result = tokio::time::timeout(refresh, idle_future) => match result {
                    Ok(Ok(IdleResponse::NewData(_))) => Ok(Wake::NewMail),
                    Ok(Ok(IdleResponse::Timeout | IdleResponse::ManualInterrupt)) | Err(_) => {
                        Ok(Wake::TimedOut)
                    }
                    Ok(Err(source)) => Err(Error::ImapIdle { source }),
                },
                trigger = triggers.recv() => {
                    // Dropping the stop source interrupts the IDLE command
                    drop(stop_source);
                    Ok(match trigger {
                        Some(trigger) => Wake::Triggered(trigger),
                        None => Wake::Shutdown,
                    })
                }
            }
        };

        let session = idle
            .done()
            .await
            .map_err(|source| Error::ImapIdle { source })?;
        self.session = Some(session);

        debug!(?outcome, "IDLE finished");
        outcome
    }

    async fn logout(&mut self) -> Result<()> {
        let timeout = self.timeouts.logout;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        tokio::time::timeout(timeout, logout(session))
            .await
            .map_err(|_| Error::LogoutTimeout { timeout })??;
        self.session = None;
        Ok(())
    }
}

impl std::fmt::Debug for ImapMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapMailbox")
            .field("folder", &self.folder)
            .field("exists", &self.exists)
            .field("locked", &self.locked)
            .field("connected", &self.session.is_some())
            .finish()
    }
}
