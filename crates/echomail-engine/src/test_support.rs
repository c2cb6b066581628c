//! Shared test doubles for the engine tests.

use std::sync::Mutex;

use async_trait::async_trait;

use echomail_core::error::{EchomailError, Result};
use echomail_mailer::MailTransport;

/// One recorded transport invocation.
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// In-memory transport: records every send, rejects scripted addresses.
#[derive(Default)]
pub struct MockMailer {
    sent: Mutex<Vec<SentMail>>,
    fail_for: Vec<String>,
}

impl MockMailer {
    pub fn failing_for(addrs: &[&str]) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_for: addrs.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MailTransport for MockMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<String> {
        if self.fail_for.iter().any(|a| a == to) {
            return Err(EchomailError::Mail(format!("rejected by provider: {to}")));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(format!("<mock-{}@test>", sent.len()))
    }
}
