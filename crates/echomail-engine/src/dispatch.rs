//! Batch dispatcher — fans a sequence out to its recipients.
//!
//! Recipients are partitioned into fixed-size batches processed strictly in
//! order; sends within a batch run concurrently, and a flat throttle delay
//! separates batches. The failure domain is one recipient: a rejected send
//! is logged and never touches its siblings or the sequence outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use echomail_core::config::EchomailConfig;
use echomail_core::types::{DeliveryRecord, Recipient, Sequence};
use echomail_mailer::MailTransport;
use echomail_store::MailStore;

/// What one dispatch accomplished. `attempted` counts transport invocations
/// (invalid addresses are skipped before counting), `sent` counts provider
/// acceptances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub attempted: usize,
    pub sent: usize,
}

/// Sends one sequence to a recipient list in throttled batches.
pub struct BatchDispatcher {
    store: Arc<MailStore>,
    mailer: Arc<dyn MailTransport>,
    base_url: String,
    batch_size: usize,
    batch_delay: Duration,
}

impl BatchDispatcher {
    pub fn new(
        store: Arc<MailStore>,
        mailer: Arc<dyn MailTransport>,
        config: &EchomailConfig,
    ) -> Self {
        Self {
            store,
            mailer,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            batch_size: config.dispatch.batch_size.max(1),
            batch_delay: Duration::from_millis(config.dispatch.batch_delay_ms),
        }
    }

    /// Dispatch `sequence` to every syntactically valid recipient.
    pub async fn dispatch(&self, sequence: &Sequence, recipients: &[Recipient]) -> DispatchOutcome {
        let valid: Vec<&str> = recipients
            .iter()
            .map(|r| r.to_email.trim())
            .filter(|to| is_valid_address(to))
            .collect();

        let mut outcome = DispatchOutcome::default();
        for (i, batch) in valid.chunks(self.batch_size).enumerate() {
            if i > 0 {
                // Flat anti-spam throttle between batches, not a backoff
                tokio::time::sleep(self.batch_delay).await;
            }
            let results = join_all(batch.iter().map(|to| self.send_one(sequence, to))).await;
            outcome.attempted += batch.len();
            outcome.sent += results.into_iter().filter(|sent| *sent).count();
        }

        tracing::info!(
            "📨 Sequence {}: {}/{} sends accepted ({} recipient(s) skipped)",
            sequence.id,
            outcome.sent,
            outcome.attempted,
            recipients.len() - valid.len()
        );
        outcome
    }

    /// One recipient: pre-generate the delivery id, embed the tracking
    /// pixel, send, and record the delivery only once the transport accepts
    /// — so tracking rows exist exactly for mail that left the building.
    async fn send_one(&self, sequence: &Sequence, to: &str) -> bool {
        let delivery_id = Uuid::new_v4().to_string();
        let html = with_tracking_pixel(&sequence.body, &self.base_url, &delivery_id);

        match self.mailer.send(to, &sequence.subject, &html).await {
            Ok(message_id) => {
                let mut rec = DeliveryRecord::new(delivery_id, sequence.id, to, Utc::now());
                rec.message_id = Some(message_id);
                if let Err(e) = self.store.insert_delivery(&rec) {
                    // The mail is already out; an untracked send beats a
                    // phantom record, so log and move on.
                    tracing::error!("❌ Sent to {to} but failed to record delivery: {e}");
                }
                true
            }
            Err(e) => {
                tracing::warn!("❌ Mail send error to {to}: {e}");
                false
            }
        }
    }
}

/// Minimal syntactic check — anything without an '@' is silently skipped.
fn is_valid_address(to: &str) -> bool {
    !to.is_empty() && to.contains('@')
}

/// Append the 1x1 invisible tracking image, parameterized by delivery id.
fn with_tracking_pixel(body: &str, base_url: &str, delivery_id: &str) -> String {
    format!(
        r#"{body}<br><img src="{base_url}/api/open?id={delivery_id}" width="1" height="1" style="display:none;" />"#
    )
}
