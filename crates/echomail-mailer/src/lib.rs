//! # EchoMail Mailer
//!
//! Outbound mail transport: async SMTP via lettre (STARTTLS + credentials,
//! Gmail-compatible), behind the `MailTransport` trait so the dispatch
//! engine can run against a mock in tests.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use echomail_core::config::SmtpConfig;
use echomail_core::error::{EchomailError, Result};

/// The send(to, subject, html) -> message-id capability the dispatcher
/// depends on. One call per recipient; failures are per-recipient.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send one HTML mail. Returns the message id on provider acceptance.
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<String>;
}

/// SMTP transport with a fixed sender identity.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
}

impl SmtpMailer {
    /// Build the STARTTLS relay from config. The relay connects lazily, so
    /// this only fails on malformed host/sender values.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| EchomailError::Mail(format!("Invalid from address: {e}")))?;

        let creds = Credentials::new(config.from_email.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| EchomailError::Mail(format!("SMTP relay: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            from,
            host: config.host.clone(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<String> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| EchomailError::Mail(format!("Invalid to address: {e}")))?;

        // Assign the message id ourselves so it can be reported back and
        // stamped onto the delivery record.
        let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), self.host);

        let email = Message::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| EchomailError::Mail(format!("Build email: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| EchomailError::Mail(format!("SMTP send: {e}")))?;

        tracing::debug!("📤 Mail accepted for {to} ({message_id})");
        Ok(message_id)
    }
}
