//! In-memory stand-ins for the mailbox, ticketing system and mail transport.

use crate::error::{Error, Result};
use crate::mailbox::{MailboxConnector, MailboxSession, Wake};
use crate::notifier::{MailTransport, Reply};
use crate::parser::IncomingMessage;
use crate::ticketing::{TicketSystem, TicketUpdateOutcome};
use crate::trigger::TriggerReceiver;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn sample_message(uid: u32, subject: &str, body: &str) -> IncomingMessage {
    IncomingMessage {
        uid,
        subject: Some(subject.to_string()),
        sender_address: "jane@example.com".to_string(),
        sender_name: Some("Jane Doe".to_string()),
        message_id: Some(format!("<{uid}@example.com>")),
        date: None,
        text: Some(body.to_string()),
        html: None,
    }
}

#[derive(Debug, Default)]
pub(crate) struct MailboxState {
    /// Oldest first; the newest message is the last one.
    pub messages: Vec<IncomingMessage>,
    pub locked: bool,
    pub lock_count: usize,
    pub deleted: Vec<u32>,
    pub unlocked_access: bool,
    pub logged_out: bool,
}

/// Scripted outcome of one idle wait.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IdleStep {
    NewMail,
    /// Stays in IDLE, deaf to triggers, then reports new mail.
    NewMailAfter(Duration),
    Fail,
}

pub(crate) struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
    idle_script: VecDeque<IdleStep>,
    fail_fetch: bool,
}

impl FakeMailbox {
    pub fn with_messages(messages: Vec<IncomingMessage>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MailboxState {
                messages,
                ..MailboxState::default()
            })),
            idle_script: VecDeque::new(),
            fail_fetch: false,
        }
    }

    pub fn state(&self) -> Arc<Mutex<MailboxState>> {
        Arc::clone(&self.state)
    }

    pub fn fail_fetch(&mut self) {
        self.fail_fetch = true;
    }

    pub fn script_idle(mut self, steps: impl IntoIterator<Item = IdleStep>) -> Self {
        self.idle_script.extend(steps);
        self
    }
}

#[async_trait]
impl MailboxSession for FakeMailbox {
    async fn lock(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.locked = true;
        state.lock_count += 1;
        Ok(())
    }

    fn unlock(&mut self) {
        self.state.lock().unwrap().locked = false;
    }

    async fn fetch_newest(&mut self) -> Result<Option<IncomingMessage>> {
        if self.fail_fetch {
            return Err(Error::SessionClosed);
        }
        let mut state = self.state.lock().unwrap();
        if !state.locked {
            state.unlocked_access = true;
        }
        Ok(state.messages.last().cloned())
    }

    async fn delete(&mut self, uid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.locked {
            state.unlocked_access = true;
        }
        let before = state.messages.len();
        state.messages.retain(|m| m.uid != uid);
        if state.messages.len() != before {
            state.deleted.push(uid);
        }
        Ok(())
    }

    async fn idle_wait(
        &mut self,
        refresh: Duration,
        triggers: &mut TriggerReceiver,
    ) -> Result<Wake> {
        match self.idle_script.pop_front() {
            Some(IdleStep::NewMail) => return Ok(Wake::NewMail),
            Some(IdleStep::NewMailAfter(delay)) => {
                tokio::time::sleep(delay).await;
                return Ok(Wake::NewMail);
            }
            Some(IdleStep::Fail) => return Err(Error::SessionClosed),
            None => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(refresh) => Ok(Wake::TimedOut),
            trigger = triggers.recv() => Ok(match trigger {
                Some(trigger) => Wake::Triggered(trigger),
                None => Wake::Shutdown,
            }),
        }
    }

    async fn logout(&mut self) -> Result<()> {
        self.state.lock().unwrap().logged_out = true;
        Ok(())
    }
}

/// Hands out scripted sessions; `None` entries and an exhausted script fail to connect.
pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<Option<FakeMailbox>>>,
    attempts: AtomicU32,
}

impl FakeConnector {
    pub fn new(script: impl IntoIterator<Item = Option<FakeMailbox>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::new([])
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().flatten();
        match next {
            Some(mailbox) => Ok(Box::new(mailbox)),
            None => Err(Error::TcpConnect {
                target: "imap.invalid:993".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeTickets {
    open: HashSet<String>,
    rejecting: HashSet<String>,
    queries: AtomicUsize,
    updates: Mutex<Vec<(String, String)>>,
}

impl FakeTickets {
    pub fn with_open<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            open: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Makes updates of `id` fail even though it is open.
    pub fn rejecting(mut self, id: &str) -> Self {
        self.rejecting.insert(id.to_string());
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(String, String)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl TicketSystem for FakeTickets {
    async fn ticket_exists(&self, ticket_id: &str) -> bool {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.open.contains(ticket_id)
    }

    async fn update_journal(&self, ticket_id: &str, content: &str) -> TicketUpdateOutcome {
        if self.rejecting.contains(ticket_id) || !self.open.contains(ticket_id) {
            return TicketUpdateOutcome::failed(ticket_id, "ticketing system returned HTTP 400");
        }
        self.updates
            .lock()
            .unwrap()
            .push((ticket_id.to_string(), content.to_string()));
        TicketUpdateOutcome::succeeded(ticket_id)
    }
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<Reply>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Reply> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_reply(&self, reply: &Reply) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::InvalidConfig {
                message: "relay unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(reply.clone());
        Ok(())
    }
}
