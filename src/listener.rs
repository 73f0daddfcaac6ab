//! Mailbox connection lifecycle.
//!
//! [`Listener`] owns the single mailbox session of the process. It connects, runs one
//! pass on connect, then alternates between waiting in IDLE and running passes when a
//! trigger is admitted. A lost session is retried after a fixed delay until the attempt
//! cap is reached, after which the listener stays [`ConnectionState::Failed`].
//!
//! ```text
//! Disconnected -> Connecting -> Idle <-> Processing
//!                     ^           |
//!                     |           v
//!                     +---- Reconnecting -> Failed
//! ```

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::mailbox::{MailboxConnector, MailboxSession, Wake};
use crate::processor::MessageProcessor;
use crate::trigger::{self, ShutdownSignal, Trigger, TriggerReceiver, TriggerSender};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of the mailbox connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Connecting, authenticating and selecting the folder.
    Connecting,
    /// Connected and waiting for a trigger.
    Idle,
    /// A pass is running.
    Processing,
    /// Waiting out the delay before the next connection attempt.
    Reconnecting,
    /// Attempts exhausted. Terminal.
    Failed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Connecting, Disconnected, Failed, Idle, Processing, Reconnecting};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Idle)
                | (Connecting, Reconnecting)
                | (Idle, Processing)
                | (Processing, Idle)
                | (Idle | Processing, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Failed)
                | (Connecting | Idle | Processing | Reconnecting, Disconnected)
        )
    }

    /// Whether the listener has given up.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Failed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Idle => "idle",
            ConnectionState::Processing => "processing",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The connection state machine, publishing every transition.
#[derive(Debug)]
pub struct MailboxConnection {
    state: watch::Sender<ConnectionState>,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
}

impl MailboxConnection {
    /// Creates a disconnected machine allowing `max_reconnect_attempts` reconnects.
    #[must_use]
    pub fn new(max_reconnect_attempts: u32) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            reconnect_attempts: 0,
            max_reconnect_attempts,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Reconnect attempts made since the last successful connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Receiver observing transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&mut self, next: ConnectionState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Ignoring invalid state transition");
            return;
        }
        debug!(from = %current, to = %next, "Connection state changed");
        self.state.send_replace(next);
    }

    /// `Disconnected`/`Reconnecting` -> `Connecting`.
    pub fn begin_connect(&mut self) {
        self.transition(ConnectionState::Connecting);
    }

    /// `Connecting` -> `Idle`. Resets the attempt counter.
    pub fn connected(&mut self) {
        self.reconnect_attempts = 0;
        self.transition(ConnectionState::Idle);
    }

    /// `Idle` -> `Processing`.
    pub fn begin_pass(&mut self) {
        self.transition(ConnectionState::Processing);
    }

    /// `Processing` -> `Idle`.
    pub fn end_pass(&mut self) {
        self.transition(ConnectionState::Idle);
    }

    /// Enters `Reconnecting` after a failure and decides whether to retry.
    ///
    /// Returns the attempt number to make, or `None` after moving to `Failed` when the
    /// cap is reached.
    pub fn connection_lost(&mut self) -> Option<u32> {
        self.transition(ConnectionState::Reconnecting);
        if self.reconnect_attempts >= self.max_reconnect_attempts {
            self.transition(ConnectionState::Failed);
            return None;
        }
        self.reconnect_attempts += 1;
        Some(self.reconnect_attempts)
    }

    /// Any live state -> `Disconnected`.
    pub fn disconnect(&mut self) {
        self.transition(ConnectionState::Disconnected);
    }
}

/// Control handle of a running [`Listener`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    state: watch::Receiver<ConnectionState>,
    triggers: TriggerSender,
    shutdown: ShutdownSignal,
}

impl ListenerHandle {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Requests a pass. Returns `false` if one is already pending or running.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        self.triggers.offer(trigger)
    }

    /// Asks the listener to log out and stop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Whether the listener stopped, by shutdown or by giving up.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state().is_terminal()
            || (self.shutdown.is_triggered() && self.state() == ConnectionState::Disconnected)
    }

    /// Waits until the state satisfies `predicate`, returning the matching state.
    ///
    /// Returns `None` if the listener is gone before that happens.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Option<ConnectionState> {
        self.state.wait_for(predicate).await.ok().map(|state| *state)
    }
}

/// Owns the mailbox session and serializes processing passes.
pub struct Listener<C> {
    connector: C,
    processor: MessageProcessor,
    config: ListenerConfig,
    connection: MailboxConnection,
    triggers: TriggerReceiver,
    sender: TriggerSender,
}

/// Why a session ended without an error.
enum SessionEnd {
    Shutdown,
}

impl<C: MailboxConnector> Listener<C> {
    /// Creates a listener and its control handle.
    #[must_use]
    pub fn new(
        connector: C,
        processor: MessageProcessor,
        config: ListenerConfig,
    ) -> (Self, ListenerHandle) {
        let (sender, triggers, shutdown) = trigger::channel_with_shutdown();
        let connection = MailboxConnection::new(config.max_reconnect_attempts);

        let handle = ListenerHandle {
            state: connection.subscribe(),
            triggers: sender.clone(),
            shutdown,
        };

        let listener = Self {
            connector,
            processor,
            config,
            connection,
            triggers,
            sender,
        };

        (listener, handle)
    }

    /// Runs until shutdown (`Ok`) or until reconnection gives up.
    #[instrument(name = "listener::run", skip_all)]
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.triggers.is_shutdown() {
                self.connection.disconnect();
                return Ok(());
            }

            self.connection.begin_connect();
            info!("Connecting to mailbox");

            let lost = match self.connector.connect().await {
                Ok(mut session) => {
                    self.connection.connected();
                    info!("Mailbox connected, listening for new mail");

                    match self.serve(session.as_mut()).await {
                        Ok(SessionEnd::Shutdown) => {
                            if let Err(e) = session.logout().await {
                                warn!(error = %e, "Logout failed");
                            }
                            self.connection.disconnect();
                            info!("Listener stopped");
                            return Ok(());
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            warn!(error = %lost, category = %lost.category(), "Mailbox connection lost");

            let Some(attempt) = self.connection.connection_lost() else {
                let attempts = self.connection.reconnect_attempts();
                error!(attempts, "Max reconnection attempts reached, giving up");
                return Err(Error::ReconnectExhausted { attempts });
            };

            info!(
                attempt,
                max = self.config.max_reconnect_attempts,
                delay_secs = self.config.reconnect_delay.as_secs(),
                "Scheduling reconnect"
            );

            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
                () = self.triggers.shutdown_requested() => {
                    self.connection.disconnect();
                    return Ok(());
                }
            }
        }
    }

    /// Drives one connected session until shutdown or a session-level error.
    async fn serve(&mut self, session: &mut dyn MailboxSession) -> Result<SessionEnd> {
        let _poll = trigger::spawn_poll_timer(self.sender.clone(), self.config.poll_interval);

        self.dispatch(Trigger::Startup, session).await?;

        loop {
            let wake = session
                .idle_wait(self.config.idle_refresh_interval, &mut self.triggers)
                .await?;

            let Some(trigger) = wake.trigger() else {
                return Ok(SessionEnd::Shutdown);
            };
            self.dispatch(trigger, session).await?;
        }
    }

    /// Runs one admitted pass. Session-level errors are returned, others are logged.
    async fn dispatch(
        &mut self,
        trigger: Trigger,
        session: &mut dyn MailboxSession,
    ) -> Result<()> {
        let Some(_permit) = self.triggers.gate().try_admit() else {
            debug!(%trigger, "Pass already running, dropping trigger");
            return Ok(());
        };

        let coalesced = self.triggers.drain();
        self.connection.begin_pass();
        debug!(%trigger, coalesced, "Starting pass");

        // A panicking pass must not take the listener down with it
        let result = AssertUnwindSafe(self.processor.run_pass(session))
            .catch_unwind()
            .await;
        self.connection.end_pass();

        let Ok(result) = result else {
            error!(%trigger, "Pass panicked, message left in the mailbox");
            return Ok(());
        };

        match result {
            Ok(report) => {
                debug!(%trigger, outcome = ?report.outcome, deleted = report.deleted, "Pass finished");
                Ok(())
            }
            Err(e) if e.is_connection_lost() => Err(e),
            Err(e) => {
                error!(%trigger, error = %e, category = %e.category(), "Pass failed");
                Ok(())
            }
        }
    }
}

impl<C> fmt::Debug for Listener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.connection.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
