//! One processing pass over the newest message of the mailbox.
//!
//! A pass locks the mailbox, reads the newest message, normalizes its body and routes
//! it: rejected messages get a notification reply and are deleted once the reply is
//! accepted, accepted messages are appended to every referenced ticket and deleted
//! after the first successful update. The lock is released on every exit path.

use crate::config::NotificationConfig;
use crate::error::Result;
use crate::extractor::{self, strip_forward_prefix};
use crate::mailbox::{MailboxLock, MailboxSession};
use crate::normalizer::normalize;
use crate::notifier::{MailTransport, Notice, Reply};
use crate::parser::IncomingMessage;
use crate::ticketing::{TicketSystem, TicketUpdateOutcome};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a pass did with the newest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The mailbox was empty.
    NoMessage,
    /// The body was empty after normalization.
    EmptyBody,
    /// No subject token named an open ticket.
    NoTicketReference,
    /// Updates were dispatched; one outcome per reference, in extraction order.
    Updated(Vec<TicketUpdateOutcome>),
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Routing result.
    pub outcome: PassOutcome,
    /// UID of the message the pass worked on.
    pub uid: Option<u32>,
    /// Whether a notification reply was accepted by the transport.
    pub notified: bool,
    /// Whether the message was deleted.
    pub deleted: bool,
}

impl PassReport {
    fn new(outcome: PassOutcome, uid: Option<u32>) -> Self {
        Self {
            outcome,
            uid,
            notified: false,
            deleted: false,
        }
    }

    /// Number of successful ticket updates.
    #[must_use]
    pub fn updated_tickets(&self) -> usize {
        match &self.outcome {
            PassOutcome::Updated(outcomes) => outcomes.iter().filter(|o| o.success).count(),
            _ => 0,
        }
    }
}

/// Runs processing passes against a mailbox session.
pub struct MessageProcessor {
    tickets: Arc<dyn TicketSystem>,
    transport: Arc<dyn MailTransport>,
    notification: NotificationConfig,
}

impl MessageProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        tickets: Arc<dyn TicketSystem>,
        transport: Arc<dyn MailTransport>,
        notification: NotificationConfig,
    ) -> Self {
        Self {
            tickets,
            transport,
            notification,
        }
    }

    /// Processes the newest message of the mailbox.
    ///
    /// Errors returned here come from the mailbox session; ticketing and reply
    /// failures are absorbed into the report.
    #[instrument(name = "processor::run_pass", skip_all)]
    pub async fn run_pass(&self, session: &mut dyn MailboxSession) -> Result<PassReport> {
        let mut lock = MailboxLock::acquire(session).await?;

        let Some(message) = lock.fetch_newest().await? else {
            debug!("No message to process");
            return Ok(PassReport::new(PassOutcome::NoMessage, None));
        };

        let subject = strip_forward_prefix(message.subject_or_default()).to_string();
        info!(
            uid = message.uid,
            from = %message.sender_address,
            subject = %subject,
            "Processing newest message"
        );

        let content = message
            .content()
            .map(|c| normalize(c.body, c.is_markup))
            .unwrap_or_default();

        if content.is_empty() {
            info!(uid = message.uid, "Message body is empty");
            let mut report = PassReport::new(PassOutcome::EmptyBody, Some(message.uid));
            self.reject(&mut lock, &message, &subject, Notice::EmptyBody, &mut report)
                .await?;
            return Ok(report);
        }

        let references = extractor::extract(&subject, self.tickets.as_ref()).await;
        if references.is_empty() {
            info!(uid = message.uid, "No valid ticket reference in subject");
            let mut report = PassReport::new(PassOutcome::NoTicketReference, Some(message.uid));
            self.reject(
                &mut lock,
                &message,
                &subject,
                Notice::NoTicketReference,
                &mut report,
            )
            .await?;
            return Ok(report);
        }

        let mut outcomes = Vec::with_capacity(references.len());
        let mut deleted = false;
        for reference in &references {
            let outcome = self
                .tickets
                .update_journal(reference.as_str(), &content)
                .await;

            if outcome.success {
                if !deleted {
                    lock.delete(message.uid).await?;
                    deleted = true;
                    debug!(uid = message.uid, ticket_id = %reference, "Message deleted");
                }
            } else {
                warn!(ticket_id = %reference, detail = %outcome.detail, "Journal update failed");
            }
            outcomes.push(outcome);
        }

        let failures: Vec<TicketUpdateOutcome> =
            outcomes.iter().filter(|o| !o.success).cloned().collect();
        let mut report = PassReport::new(PassOutcome::Updated(outcomes), Some(message.uid));
        report.deleted = deleted;

        if self.notification.notify_on_update_failure && !failures.is_empty() {
            let notice = Notice::UpdateFailed(failures);
            if self.notify(&message, &subject, &notice).await {
                report.notified = true;
                // The sender knows; keeping the message would repeat the notice every pass
                if !report.deleted {
                    lock.delete(message.uid).await?;
                    report.deleted = true;
                }
            }
        }

        info!(
            uid = message.uid,
            updated = report.updated_tickets(),
            references = references.len(),
            deleted = report.deleted,
            "Pass complete"
        );
        Ok(report)
    }

    /// Replies with `notice`, then deletes the message once the reply was accepted.
    async fn reject(
        &self,
        lock: &mut MailboxLock<'_>,
        message: &IncomingMessage,
        subject: &str,
        notice: Notice,
        report: &mut PassReport,
    ) -> Result<()> {
        if !self.notify(message, subject, &notice).await {
            warn!(uid = message.uid, "Keeping message for manual review");
            return Ok(());
        }

        report.notified = true;
        lock.delete(message.uid).await?;
        report.deleted = true;
        Ok(())
    }

    async fn notify(&self, message: &IncomingMessage, subject: &str, notice: &Notice) -> bool {
        let reply = Reply::for_notice(notice, message, subject, &self.notification);
        match self.transport.send_reply(&reply).await {
            Ok(()) => {
                info!(to = %reply.to, notice = %notice.summary(), "Notification sent");
                true
            }
            Err(e) => {
                warn!(to = %reply.to, error = %e, "Failed to send notification");
                false
            }
        }
    }
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("notification", &self.notification)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_message, FakeMailbox, FakeTickets, RecordingTransport};

    struct Harness {
        tickets: Arc<FakeTickets>,
        transport: Arc<RecordingTransport>,
        processor: MessageProcessor,
    }

    fn harness(tickets: FakeTickets, transport: RecordingTransport, notify: bool) -> Harness {
        let tickets = Arc::new(tickets);
        let transport = Arc::new(transport);
        let notification = NotificationConfig {
            notify_on_update_failure: notify,
            ..NotificationConfig::default()
        };
        let processor = MessageProcessor::new(tickets.clone(), transport.clone(), notification);
        Harness {
            tickets,
            transport,
            processor,
        }
    }

    #[tokio::test]
    async fn test_empty_mailbox() {
        let h = harness(FakeTickets::default(), RecordingTransport::default(), false);
        let mut mailbox = FakeMailbox::with_messages(vec![]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();
        assert_eq!(report.outcome, PassOutcome::NoMessage);
        assert!(!state.lock().unwrap().locked);
    }

    #[tokio::test]
    async fn test_successful_update_deletes_message() {
        let h = harness(
            FakeTickets::with_open(["IM1001"]),
            RecordingTransport::default(),
            false,
        );
        let mut mailbox = FakeMailbox::with_messages(vec![
            sample_message(1, "older", "old"),
            sample_message(2, "Fw: Re: #IM1001 printer", "Fixed it.\n----- Original message -----\nquoted"),
        ]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        assert_eq!(report.uid, Some(2));
        assert!(report.deleted);
        assert!(!report.notified);
        assert_eq!(report.updated_tickets(), 1);
        assert_eq!(
            h.tickets.updates(),
            vec![("IM1001".to_string(), "Fixed it.".to_string())]
        );
        assert!(h.transport.sent().is_empty());

        let state = state.lock().unwrap();
        assert_eq!(state.deleted, vec![2]);
        assert_eq!(state.messages.len(), 1);
        assert!(!state.locked);
        assert!(!state.unlocked_access);
    }

    #[tokio::test]
    async fn test_empty_body_notifies_then_deletes() {
        let h = harness(
            FakeTickets::with_open(["IM1"]),
            RecordingTransport::default(),
            false,
        );
        let mut mailbox =
            FakeMailbox::with_messages(vec![sample_message(5, "#IM1", ">\n> \n\n")]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        assert_eq!(report.outcome, PassOutcome::EmptyBody);
        assert!(report.notified);
        assert!(report.deleted);
        // Extraction never ran
        assert_eq!(h.tickets.queries(), 0);

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Re: #IM1");
        assert_eq!(sent[0].in_reply_to.as_deref(), Some("<5@example.com>"));
        assert_eq!(state.lock().unwrap().deleted, vec![5]);
    }

    #[tokio::test]
    async fn test_no_ticket_reference_notifies_then_deletes() {
        let h = harness(
            FakeTickets::with_open(["IM1"]),
            RecordingTransport::default(),
            false,
        );
        let mut mailbox = FakeMailbox::with_messages(vec![sample_message(9, "#IM404 broken", "help")]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        assert_eq!(report.outcome, PassOutcome::NoTicketReference);
        assert!(report.deleted);
        assert_eq!(h.transport.sent().len(), 1);
        assert!(h.transport.sent()[0].html.contains("#IM1234567"));
        assert_eq!(state.lock().unwrap().deleted, vec![9]);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_message() {
        let h = harness(FakeTickets::default(), RecordingTransport::failing(), false);
        let mut mailbox = FakeMailbox::with_messages(vec![sample_message(3, "no ticket", "body")]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        assert_eq!(report.outcome, PassOutcome::NoTicketReference);
        assert!(!report.notified);
        assert!(!report.deleted);
        let state = state.lock().unwrap();
        assert!(state.deleted.is_empty());
        assert!(!state.locked);
    }

    #[tokio::test]
    async fn test_partial_failure_deletes_without_notice() {
        let h = harness(
            FakeTickets::with_open(["IM1", "IM2"]).rejecting("IM2"),
            RecordingTransport::default(),
            false,
        );
        let mut mailbox = FakeMailbox::with_messages(vec![sample_message(4, "#IM1 #IM2", "update")]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        let PassOutcome::Updated(outcomes) = &report.outcome else {
            panic!("expected updates, got {:?}", report.outcome);
        };
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(report.deleted);
        assert!(!report.notified);
        assert!(h.transport.sent().is_empty());
        assert_eq!(state.lock().unwrap().deleted, vec![4]);
    }

    #[tokio::test]
    async fn test_all_failed_keeps_message_by_default() {
        let h = harness(
            FakeTickets::with_open(["IM1"]).rejecting("IM1"),
            RecordingTransport::default(),
            false,
        );
        let mut mailbox = FakeMailbox::with_messages(vec![sample_message(6, "#IM1", "update")]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        assert!(!report.deleted);
        assert_eq!(report.updated_tickets(), 0);
        assert!(h.transport.sent().is_empty());
        assert!(state.lock().unwrap().deleted.is_empty());
    }

    #[tokio::test]
    async fn test_failure_notice_when_enabled() {
        let h = harness(
            FakeTickets::with_open(["IM1", "IM2", "IM3"])
                .rejecting("IM2")
                .rejecting("IM3"),
            RecordingTransport::default(),
            true,
        );
        let mut mailbox = FakeMailbox::with_messages(vec![sample_message(8, "#IM1 #IM2 #IM3", "x")]);

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        assert!(report.notified);
        assert!(report.deleted);
        // One reply per pass, covering both failures
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("IM2"));
        assert!(sent[0].text.contains("IM3"));
    }

    #[tokio::test]
    async fn test_duplicate_references_update_twice_delete_once() {
        let h = harness(
            FakeTickets::with_open(["IM7"]),
            RecordingTransport::default(),
            false,
        );
        let mut mailbox = FakeMailbox::with_messages(vec![sample_message(2, "#IM7 again #IM7", "note")]);
        let state = mailbox.state();

        let report = h.processor.run_pass(&mut mailbox).await.unwrap();

        assert_eq!(report.updated_tickets(), 2);
        assert_eq!(h.tickets.updates().len(), 2);
        assert_eq!(state.lock().unwrap().deleted, vec![2]);
    }

    #[tokio::test]
    async fn test_session_error_releases_lock() {
        let h = harness(FakeTickets::default(), RecordingTransport::default(), false);
        let mut mailbox = FakeMailbox::with_messages(vec![sample_message(1, "#IM1", "x")]);
        mailbox.fail_fetch();
        let state = mailbox.state();

        let err = h.processor.run_pass(&mut mailbox).await.unwrap_err();

        assert!(err.is_connection_lost());
        assert!(!state.lock().unwrap().locked);
    }

    #[tokio::test]
    async fn test_html_body_is_rendered() {
        let h = harness(
            FakeTickets::with_open(["IM5"]),
            RecordingTransport::default(),
            false,
        );
        let mut message = sample_message(1, "#IM5", "");
        message.text = None;
        message.html = Some("<p>Disk replaced</p><img src=\"cid:x\">".to_string());
        let mut mailbox = FakeMailbox::with_messages(vec![message]);

        h.processor.run_pass(&mut mailbox).await.unwrap();

        let updates = h.tickets.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, "Disk replaced");
    }
}
