//! Mailbox session abstraction.
//!
//! The listener and the processor only see [`MailboxConnector`] and [`MailboxSession`];
//! the IMAP implementation lives in `session`. Fetching and deleting go through a
//! [`MailboxLock`], which releases the mailbox when dropped.

use crate::error::Result;
use crate::parser::IncomingMessage;
use crate::trigger::{Trigger, TriggerReceiver};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// How an idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The server announced a mailbox change.
    NewMail,
    /// The refresh interval elapsed.
    TimedOut,
    /// A trigger arrived from another source.
    Triggered(Trigger),
    /// Shutdown was requested.
    Shutdown,
}

impl Wake {
    /// The trigger a pass started by this wake-up runs under, if any.
    #[must_use]
    pub fn trigger(self) -> Option<Trigger> {
        match self {
            Wake::NewMail => Some(Trigger::Push),
            Wake::TimedOut => Some(Trigger::IdleRefresh),
            Wake::Triggered(trigger) => Some(trigger),
            Wake::Shutdown => None,
        }
    }
}

/// An authenticated mailbox session with the folder selected.
#[async_trait]
pub trait MailboxSession: Send {
    /// Takes the mailbox for a fetch/delete sequence, refreshing its view.
    async fn lock(&mut self) -> Result<()>;

    /// Releases the mailbox taken by [`lock`](Self::lock).
    fn unlock(&mut self);

    /// Fetches the most recent message, or `None` when the folder is empty.
    async fn fetch_newest(&mut self) -> Result<Option<IncomingMessage>>;

    /// Deletes the message with `uid`. Deleting a message that is already gone is a no-op.
    async fn delete(&mut self, uid: u32) -> Result<()>;

    /// Waits for a change notification, the `refresh` timeout, a trigger or shutdown.
    async fn idle_wait(&mut self, refresh: Duration, triggers: &mut TriggerReceiver)
        -> Result<Wake>;

    /// Ends the session.
    async fn logout(&mut self) -> Result<()>;
}

/// Opens mailbox sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connects, authenticates and selects the folder.
    async fn connect(&self) -> Result<Box<dyn MailboxSession>>;
}

#[async_trait]
impl<T: MailboxConnector + ?Sized> MailboxConnector for Arc<T> {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        (**self).connect().await
    }
}

/// Exclusive use of the mailbox for one pass. Unlocks on drop.
pub struct MailboxLock<'a> {
    session: &'a mut dyn MailboxSession,
}

impl<'a> MailboxLock<'a> {
    /// Locks the mailbox of `session`.
    pub async fn acquire(session: &'a mut dyn MailboxSession) -> Result<MailboxLock<'a>> {
        session.lock().await?;
        trace!("Mailbox locked");
        Ok(Self { session })
    }

    /// Fetches the most recent message.
    pub async fn fetch_newest(&mut self) -> Result<Option<IncomingMessage>> {
        self.session.fetch_newest().await
    }

    /// Deletes the message with `uid`.
    pub async fn delete(&mut self, uid: u32) -> Result<()> {
        self.session.delete(uid).await
    }
}

impl Drop for MailboxLock<'_> {
    fn drop(&mut self) {
        self.session.unlock();
        trace!("Mailbox lock released");
    }
}

impl std::fmt::Debug for MailboxLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxLock").finish_non_exhaustive()
    }
}
