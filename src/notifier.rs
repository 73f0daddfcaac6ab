//! Notification replies to senders.
//!
//! A [`Notice`] says why a message was not (fully) forwarded. [`Reply::for_notice`]
//! turns it into a reply addressed to the original sender, and a [`MailTransport`]
//! delivers it. [`SmtpMailer`] is the SMTP implementation.

use crate::config::{NotificationConfig, SmtpConfig};
use crate::error::{Error, Result};
use crate::parser::IncomingMessage;
use crate::ticketing::TicketUpdateOutcome;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info, instrument};

/// Why the sender is being notified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The message body was empty after normalization.
    EmptyBody,
    /// The subject references no open ticket.
    NoTicketReference,
    /// One or more referenced tickets could not be updated.
    UpdateFailed(Vec<TicketUpdateOutcome>),
}

impl Notice {
    /// Short plain-text statement of the problem.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Notice::EmptyBody => "The body of your email is empty.".to_string(),
            Notice::NoTicketReference => "No ticket IDs found in email subject.".to_string(),
            Notice::UpdateFailed(failures) => failures
                .iter()
                .map(|f| format!("Ticket {} could not be updated: {}", f.ticket_id, f.detail))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn html_paragraphs(&self) -> Vec<String> {
        match self {
            Notice::EmptyBody => vec![
                "We noticed that the body of your email is empty. Please include the \
                 necessary details in the email body and resend your email so that we \
                 can process your request."
                    .to_string(),
            ],
            Notice::NoTicketReference => vec![
                "We were unable to locate any valid ticket IDs in the subject of your email."
                    .to_string(),
                "To update a ticket, the subject line must prepend with \"#\" followed by \
                 the ticket ID (e.g., #IM1234567). Please correct the subject and resend \
                 your email."
                    .to_string(),
            ],
            Notice::UpdateFailed(failures) => {
                let mut paragraphs: Vec<String> = failures
                    .iter()
                    .map(|f| {
                        format!(
                            "We could not add your email to ticket {}. Reason: {}",
                            escape_html(&f.ticket_id),
                            escape_html(&f.detail)
                        )
                    })
                    .collect();
                paragraphs.push(
                    "The ticket may be resolved or closed. Please contact the support team \
                     if the issue persists."
                        .to_string(),
                );
                paragraphs
            }
        }
    }
}

/// A reply ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Recipient address.
    pub to: String,
    /// Recipient display name, if known.
    pub to_name: Option<String>,
    /// Reply subject (`Re: <original subject>`).
    pub subject: String,
    /// Plain-text alternative.
    pub text: String,
    /// HTML alternative.
    pub html: String,
    /// `Message-ID` of the message being answered.
    pub in_reply_to: Option<String>,
}

impl Reply {
    /// Composes the reply to `message` for `notice`.
    ///
    /// `subject` is the subject as processed (forward prefix already stripped).
    #[must_use]
    pub fn for_notice(
        notice: &Notice,
        message: &IncomingMessage,
        subject: &str,
        config: &NotificationConfig,
    ) -> Self {
        let greeting = escape_html(message.greeting_name());
        let mut html = format!("<p>Dear {greeting},</p>\n");
        for paragraph in notice.html_paragraphs() {
            html.push_str(&format!("<p>{paragraph}</p>\n"));
        }
        html.push_str(&format!(
            "<p>Best regards,<br>{}</p>",
            escape_html(&config.signature)
        ));

        let text = format!(
            "Dear {},\n\n{}\n\nBest regards,\n{}",
            message.greeting_name(),
            notice.summary(),
            config.signature
        );

        Self {
            to: message.sender_address.clone(),
            to_name: message.sender_name.clone(),
            subject: format!("Re: {subject}"),
            text,
            html,
            in_reply_to: message.message_id.clone(),
        }
    }
}

/// Delivers replies.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Sends `reply`; `Ok` means the relay accepted it.
    async fn send_reply(&self, reply: &Reply) -> Result<()>;
}

/// SMTP delivery through lettre.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Creates the mailer. Port 465 uses implicit TLS, other ports STARTTLS.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = if config.implicit_tls() {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|source| Error::SmtpTransport {
            host: config.host.clone(),
            source,
        })?
        .port(config.port);

        let builder = if config.username.is_empty() {
            builder
        } else {
            builder.credentials(Credentials::new(
                config.username.clone(),
                config.password().to_string(),
            ))
        };

        let address = config
            .from
            .as_str()
            .parse::<Address>()
            .map_err(|source| Error::InvalidAddress {
                address: config.from.to_string(),
                source,
            })?;

        Ok(Self {
            transport: builder.build(),
            from: Mailbox::new(Some(config.from_name.clone()), address),
        })
    }

    /// The footer appended to every HTML reply.
    fn footer(&self) -> String {
        format!(
            "<h4>If this mail is irrelevant, kindly remove {}</h4>",
            escape_html(&self.from.email.to_string())
        )
    }

    fn build_message(&self, reply: &Reply) -> Result<Message> {
        let address = reply
            .to
            .parse::<Address>()
            .map_err(|source| Error::InvalidAddress {
                address: reply.to.clone(),
                source,
            })?;
        let to = Mailbox::new(reply.to_name.clone(), address);

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&reply.subject);

        if let Some(ref id) = reply.in_reply_to {
            builder = builder.in_reply_to(id.clone()).references(id.clone());
        }

        let html = format!("{}\n{}", reply.html, self.footer());
        builder
            .multipart(MultiPart::alternative_plain_html(reply.text.clone(), html))
            .map_err(|source| Error::BuildMessage { source })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    #[instrument(name = "notifier::send_reply", skip_all, fields(to = %reply.to, subject = %reply.subject))]
    async fn send_reply(&self, reply: &Reply) -> Result<()> {
        let message = self.build_message(reply)?;

        debug!("Sending reply");

        self.transport
            .send(message)
            .await
            .map_err(|source| Error::SmtpSend {
                to: reply.to.clone(),
                source,
            })?;

        info!("Reply sent");
        Ok(())
    }
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    fn message() -> IncomingMessage {
        IncomingMessage {
            uid: 3,
            subject: Some("#IM1 printer".into()),
            sender_address: "jane@example.com".into(),
            sender_name: Some("Jane <Ops>".into()),
            message_id: Some("<m1@example.com>".into()),
            date: None,
            text: None,
            html: None,
        }
    }

    fn smtp_config(port: u16) -> SmtpConfig {
        BridgeConfig::builder()
            .imap_host("imap.example.com")
            .imap_credentials("desk@example.com", "pw")
            .ticketing_host("sm.example.com")
            .ticketing_credentials("falcon", "secret")
            .smtp_host("smtp.example.com")
            .smtp_port(port)
            .smtp_credentials("desk@example.com", "pw")
            .build()
            .unwrap()
            .smtp
    }

    #[test]
    fn test_empty_body_reply() {
        let reply = Reply::for_notice(
            &Notice::EmptyBody,
            &message(),
            "#IM1 printer",
            &NotificationConfig::default(),
        );

        assert_eq!(reply.to, "jane@example.com");
        assert_eq!(reply.subject, "Re: #IM1 printer");
        assert_eq!(reply.in_reply_to.as_deref(), Some("<m1@example.com>"));
        assert!(reply.html.contains("Dear Jane &lt;Ops&gt;,"));
        assert!(reply.html.contains("body of your email is empty"));
        assert!(reply.html.contains("SOC Support Team"));
        assert!(reply.text.contains("The body of your email is empty."));
    }

    #[test]
    fn test_no_ticket_reply_explains_format() {
        let reply = Reply::for_notice(
            &Notice::NoTicketReference,
            &message(),
            "printer",
            &NotificationConfig::default(),
        );
        assert_eq!(reply.subject, "Re: printer");
        assert!(reply.html.contains("#IM1234567"));
        assert!(reply.text.contains("No ticket IDs found"));
    }

    #[test]
    fn test_update_failed_reply_escapes_detail() {
        let notice = Notice::UpdateFailed(vec![
            TicketUpdateOutcome::failed("IM1", "HTTP 400: <bad>"),
            TicketUpdateOutcome::failed("IM2", "ticket IM2 is resolved, closed, or invalid"),
        ]);
        let reply = Reply::for_notice(&notice, &message(), "#IM1", &NotificationConfig::default());
        assert!(reply.html.contains("HTTP 400: &lt;bad&gt;"));
        assert!(reply.text.contains("Ticket IM1 could not be updated"));
        assert!(reply.text.contains("Ticket IM2 could not be updated"));
    }

    #[tokio::test]
    async fn test_built_message_threads_and_footer() {
        let mailer = SmtpMailer::new(&smtp_config(587)).unwrap();
        let reply = Reply::for_notice(
            &Notice::EmptyBody,
            &message(),
            "#IM1 printer",
            &NotificationConfig::default(),
        );

        let formatted = String::from_utf8(mailer.build_message(&reply).unwrap().formatted()).unwrap();
        assert!(formatted.contains("In-Reply-To: <m1@example.com>"));
        assert!(formatted.contains("References: <m1@example.com>"));
        assert!(formatted.contains("Subject: Re: #IM1 printer"));
        assert!(formatted.contains("Attachment Email Parser"));
        assert_eq!(
            mailer.footer(),
            "<h4>If this mail is irrelevant, kindly remove desk@example.com</h4>"
        );
    }

    #[tokio::test]
    async fn test_invalid_recipient() {
        let mailer = SmtpMailer::new(&smtp_config(465)).unwrap();
        let mut reply = Reply::for_notice(
            &Notice::EmptyBody,
            &message(),
            "x",
            &NotificationConfig::default(),
        );
        reply.to = "not an address".into();

        let err = mailer.send_reply(&reply).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&#39;");
    }
}
