//! Trigger sources and the single-flight admission gate.
//!
//! Every reason to look at the mailbox (an IDLE push, the IDLE refresh, the poll timer,
//! a manual request) is a [`Trigger`]. Producers hand triggers to a [`TriggerSender`],
//! which feeds a depth-1 queue and drops the trigger when a pass is already pending or
//! running. The consumer admits at most one pass at a time through [`AdmissionGate`].
//!
//! ```
//! use mail_ticket_bridge::trigger::{channel, Trigger};
//!
//! let (sender, mut receiver) = channel();
//! assert!(sender.offer(Trigger::Poll));
//! // A second trigger while one is pending collapses into the first
//! assert!(!sender.offer(Trigger::Manual));
//! assert_eq!(receiver.drain(), 1);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Why a processing pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// The session was (re)established.
    Startup,
    /// The server pushed a change notification during IDLE.
    Push,
    /// The IDLE refresh interval elapsed without a notification.
    IdleRefresh,
    /// The safety-net poll timer fired.
    Poll,
    /// Someone asked for a pass through the HTTP surface.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Startup => "startup",
            Trigger::Push => "push",
            Trigger::IdleRefresh => "idle_refresh",
            Trigger::Poll => "poll",
            Trigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Single-permit gate guaranteeing at most one pass in flight.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    slot: Arc<Semaphore>,
}

/// Proof that a pass was admitted. The gate reopens when it is dropped.
#[derive(Debug)]
pub struct PassPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Admits a pass if none is running; returns `None` (drop) otherwise.
    #[must_use]
    pub fn try_admit(&self) -> Option<PassPermit> {
        Arc::clone(&self.slot)
            .try_acquire_owned()
            .ok()
            .map(|permit| PassPermit { _permit: permit })
    }

    /// Whether a pass currently holds the gate.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the trigger queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    tx: mpsc::Sender<Trigger>,
    gate: AdmissionGate,
}

impl TriggerSender {
    /// Offers a trigger; returns `true` if it was queued.
    ///
    /// The trigger is dropped when a pass is running or another trigger is already
    /// pending: that pass (or the pending one) will observe the same mailbox state.
    pub fn offer(&self, trigger: Trigger) -> bool {
        if self.gate.is_busy() {
            debug!(%trigger, "Pass in flight, dropping trigger");
            return false;
        }

        match self.tx.try_send(trigger) {
            Ok(()) => {
                trace!(%trigger, "Trigger queued");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%trigger, "Trigger already pending, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%trigger, "Listener gone, dropping trigger");
                false
            }
        }
    }

    /// The gate shared with the consumer.
    #[must_use]
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }
}

/// Consumer side of the trigger queue, also observing the shutdown flag.
#[derive(Debug)]
pub struct TriggerReceiver {
    rx: mpsc::Receiver<Trigger>,
    shutdown: watch::Receiver<bool>,
    gate: AdmissionGate,
}

impl TriggerReceiver {
    /// Waits for the next trigger. Returns `None` once shutdown is requested.
    pub async fn recv(&mut self) -> Option<Trigger> {
        if self.is_shutdown() {
            return None;
        }

        // Without a shutdown owner the first branch is disabled
        tokio::select! {
            biased;
            Ok(_) = self.shutdown.wait_for(|stop| *stop) => None,
            trigger = self.rx.recv() => trigger,
        }
    }

    /// Resolves once shutdown is requested, ignoring triggers in the meantime.
    ///
    /// Never resolves if the [`ShutdownSignal`] was dropped unused.
    pub async fn shutdown_requested(&mut self) {
        if self.shutdown.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Discards pending triggers; the pass about to run covers them.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// The admission gate of this queue.
    #[must_use]
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }
}

/// Handle used to request shutdown of everything attached to a trigger queue.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.flag.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }
}

/// Creates a depth-1 trigger queue with its gate, ignoring shutdown.
#[must_use]
pub fn channel() -> (TriggerSender, TriggerReceiver) {
    let (sender, receiver, _signal) = channel_with_shutdown();
    (sender, receiver)
}

/// Creates a depth-1 trigger queue, its gate and the shutdown signal for its consumer.
#[must_use]
pub fn channel_with_shutdown() -> (TriggerSender, TriggerReceiver, ShutdownSignal) {
    let (tx, rx) = mpsc::channel(1);
    let (flag, shutdown) = watch::channel(false);
    let gate = AdmissionGate::new();

    (
        TriggerSender {
            tx,
            gate: gate.clone(),
        },
        TriggerReceiver { rx, shutdown, gate },
        ShutdownSignal {
            flag: Arc::new(flag),
        },
    )
}

/// A spawned trigger producer, aborted when dropped.
#[derive(Debug)]
pub struct ProducerTask {
    handle: JoinHandle<()>,
}

impl Drop for ProducerTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns the fixed-interval poll timer feeding [`Trigger::Poll`].
///
/// The first tick fires one full `interval` after spawning.
#[must_use]
pub fn spawn_poll_timer(sender: TriggerSender, interval: Duration) -> ProducerTask {
    let handle = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Polling for new emails");
            sender.offer(Trigger::Poll);
        }
    });

    ProducerTask { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_single_flight() {
        let gate = AdmissionGate::new();
        let permit = gate.try_admit();
        assert!(permit.is_some());
        assert!(gate.is_busy());
        assert!(gate.try_admit().is_none());

        drop(permit);
        assert!(!gate.is_busy());
        assert!(gate.try_admit().is_some());
    }

    #[test]
    fn test_simultaneous_offers_collapse() {
        let (sender, mut receiver) = channel();
        assert!(sender.offer(Trigger::Push));
        assert!(!sender.offer(Trigger::Poll));
        assert_eq!(receiver.drain(), 1);
        assert_eq!(receiver.drain(), 0);
    }

    #[test]
    fn test_offer_dropped_while_pass_in_flight() {
        let (sender, mut receiver) = channel();
        let permit = receiver.gate().try_admit().unwrap();

        assert!(!sender.offer(Trigger::Poll));
        assert_eq!(receiver.drain(), 0);

        drop(permit);
        assert!(sender.offer(Trigger::Poll));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_shutdown() {
        let (sender, mut receiver, signal) = channel_with_shutdown();
        assert!(sender.offer(Trigger::Manual));
        assert_eq!(receiver.recv().await, Some(Trigger::Manual));

        signal.trigger();
        assert!(signal.is_triggered());
        assert!(receiver.is_shutdown());
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timer_offers_after_interval() {
        let (sender, mut receiver) = channel();
        let task = spawn_poll_timer(sender, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(receiver.drain(), 0);

        assert_eq!(receiver.recv().await, Some(Trigger::Poll));
        drop(task);
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::IdleRefresh.to_string(), "idle_refresh");
        assert_eq!(Trigger::Push.to_string(), "push");
    }
}
