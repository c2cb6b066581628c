//! Sequence claim & lifecycle — one pass over everything due.
//!
//! The pass walks due sequences sequentially; fan-out only happens inside
//! the batch dispatcher. Every sequence is processed behind its own failure
//! boundary: a broken sequence is put back to `pending` and the pass moves
//! on. Overlapping passes (other threads, other processes) coordinate only
//! through the store's conditional claim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use echomail_core::config::EchomailConfig;
use echomail_core::error::Result;
use echomail_core::types::{Recurrence, Sequence};
use echomail_mailer::MailTransport;
use echomail_store::MailStore;

use crate::dispatch::BatchDispatcher;
use crate::recurrence;

/// Aggregate of one pass: total accepted sends plus per-sequence failure
/// reasons. Skipped claims are not failures and do not appear here.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub sent: u64,
    pub errors: HashMap<i64, String>,
}

/// Runs dispatch passes. Constructed once at startup with its dependencies
/// passed in explicitly — the runner owns no ambient state.
pub struct SequenceRunner {
    store: Arc<MailStore>,
    dispatcher: BatchDispatcher,
    pass_deadline: Option<Duration>,
}

impl SequenceRunner {
    pub fn new(
        store: Arc<MailStore>,
        mailer: Arc<dyn MailTransport>,
        config: &EchomailConfig,
    ) -> Self {
        let dispatcher = BatchDispatcher::new(store.clone(), mailer, config);
        Self {
            store,
            dispatcher,
            pass_deadline: config.dispatch.pass_deadline_secs.map(Duration::from_secs),
        }
    }

    /// One pass over all sequences due at `now`.
    ///
    /// Only the initial due-query can fail the whole run; past that point
    /// every error is contained to its sequence. State transitions already
    /// committed stay committed no matter what happens later in the pass.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let due = self.store.due_sequences(now)?;
        if due.is_empty() {
            return Ok(RunSummary::default());
        }
        tracing::info!("🔹 Pass start: {} sequence(s) due", due.len());

        let deadline = self.pass_deadline.map(|d| Instant::now() + d);
        let mut summary = RunSummary::default();

        for sequence in due {
            if deadline.is_some_and(|dl| Instant::now() >= dl) {
                tracing::warn!(
                    "⏳ Pass deadline reached — remaining sequences stay pending for the next run"
                );
                break;
            }

            match self.process_sequence(&sequence, now).await {
                Ok(sent) => summary.sent += sent as u64,
                Err(reason) => {
                    tracing::error!("❌ Sequence {} failed: {reason}", sequence.id);
                    summary.errors.insert(sequence.id, reason);
                }
            }
        }

        tracing::info!(
            "📈 Pass end: {} mail(s) sent, {} sequence error(s)",
            summary.sent,
            summary.errors.len()
        );
        Ok(summary)
    }

    /// Per-sequence boundary. `Err` carries a human-readable reason for the
    /// summary; the sequence's stored state has already been settled
    /// (released for retry or marked terminal) before this returns.
    async fn process_sequence(
        &self,
        sequence: &Sequence,
        now: DateTime<Utc>,
    ) -> std::result::Result<usize, String> {
        // Atomic claim — the sole concurrency guard. Zero rows means another
        // worker owns it (or it changed state); not an error, just skip.
        match self.store.claim(sequence.id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("⚠️ Sequence {} already claimed elsewhere", sequence.id);
                return Ok(0);
            }
            // Nothing was claimed, so nothing to release.
            Err(e) => return Err(format!("claim failed: {e}")),
        }
        tracing::info!(
            "➡️ Processing sequence {} | subject: {} | scheduled_at: {}",
            sequence.id,
            sequence.subject,
            sequence.scheduled_at
        );

        // A fetch failure is transient: back to pending, retry next pass.
        let recipients = match self.store.recipients(sequence.id) {
            Ok(r) => r,
            Err(e) => {
                self.release_for_retry(sequence.id);
                return Err(format!("recipient fetch failed: {e}"));
            }
        };

        // No recipients is a data error: terminal until fixed externally.
        if recipients.is_empty() {
            if let Err(e) = self.store.mark_error(sequence.id, "No recipients") {
                self.release_for_retry(sequence.id);
                return Err(format!("no recipients (and marking error failed: {e})"));
            }
            return Err("no recipients".into());
        }

        // Dispatch never fails as a whole; failures are per-recipient.
        let outcome = self.dispatcher.dispatch(sequence, &recipients).await;

        match self.finish(sequence, now) {
            Ok(()) => Ok(outcome.sent),
            Err(e) => {
                self.release_for_retry(sequence.id);
                Err(format!("finalize failed: {e}"))
            }
        }
    }

    /// Settle a dispatched sequence: terminal completion for `once`,
    /// otherwise reschedule at the next occurrence (or complete when no
    /// next occurrence exists, including unknown recurrence tags).
    fn finish(&self, sequence: &Sequence, now: DateTime<Utc>) -> Result<()> {
        if sequence.recurrence() == Some(Recurrence::Once) {
            self.store.complete(sequence.id)?;
            tracing::info!("🟢 Sequence {} completed", sequence.id);
            return Ok(());
        }

        match recurrence::next_occurrence(sequence.scheduled_at, &sequence.recurrence, now) {
            Some(next) => {
                self.store.reschedule(sequence.id, next)?;
                tracing::info!("🌀 Sequence {} rescheduled for {next}", sequence.id);
            }
            None => {
                tracing::warn!(
                    "⚠️ No next occurrence for sequence {} ({:?}) — marking completed",
                    sequence.id,
                    sequence.recurrence
                );
                self.store.complete(sequence.id)?;
            }
        }
        Ok(())
    }

    /// Best-effort return to `pending` so the next pass retries. If even
    /// this write fails the sequence is stuck in `sending` until the store
    /// recovers; there is nothing more to do from here.
    fn release_for_retry(&self, id: i64) {
        if let Err(e) = self.store.release(id) {
            tracing::error!("❌ Could not release sequence {id} back to pending: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockMailer;
    use chrono::Duration as ChronoDuration;
    use echomail_core::types::SequenceStatus;

    fn test_config() -> EchomailConfig {
        let mut config = EchomailConfig::default();
        config.base_url = "https://mail.test".into();
        config.dispatch.batch_size = 2;
        config.dispatch.batch_delay_ms = 1;
        config
    }

    fn runner_with(mailer: Arc<MockMailer>, config: &EchomailConfig) -> (SequenceRunner, Arc<MailStore>) {
        let store = Arc::new(MailStore::open_in_memory().unwrap());
        let runner = SequenceRunner::new(store.clone(), mailer, config);
        (runner, store)
    }

    #[tokio::test]
    async fn test_noop_pass_when_nothing_due() {
        let (runner, store) = runner_with(Arc::new(MockMailer::default()), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("later", "<p>b</p>", now + ChronoDuration::hours(1), "once")
            .unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert!(summary.errors.is_empty());
        // No rows were mutated
        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Pending);
        assert!(store.deliveries_for_sequence(id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_daily_sequence() {
        // 3 recipients, batch size 2: batch (1,2), throttle, batch (3)
        let mailer = Arc::new(MockMailer::default());
        let (runner, store) = runner_with(mailer.clone(), &test_config());
        let now = Utc::now();
        let scheduled = now - ChronoDuration::minutes(5);
        let id = store
            .create_sequence("daily digest", "<p>news</p>", scheduled, "daily")
            .unwrap();
        for addr in ["a@x.com", "b@x.com", "c@x.com"] {
            store.add_recipient(id, addr).unwrap();
        }

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 3);
        assert!(summary.errors.is_empty());
        assert_eq!(mailer.sent_count(), 3);
        assert_eq!(store.deliveries_for_sequence(id).unwrap().len(), 3);

        // Rescheduled: pending again, one day after the original time
        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Pending);
        assert_eq!(
            seq.scheduled_at.timestamp(),
            (scheduled + ChronoDuration::days(1)).timestamp()
        );
    }

    #[tokio::test]
    async fn test_once_sequence_completes() {
        let mailer = Arc::new(MockMailer::default());
        let (runner, store) = runner_with(mailer.clone(), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("one-shot", "<p>b</p>", now, "once")
            .unwrap();
        store.add_recipient(id, "a@x.com").unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 1);
        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Completed);
    }

    #[tokio::test]
    async fn test_no_recipients_is_terminal_error() {
        let mailer = Arc::new(MockMailer::default());
        let (runner, store) = runner_with(mailer.clone(), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("empty", "<p>b</p>", now, "once")
            .unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.errors.get(&id).map(String::as_str), Some("no recipients"));
        assert_eq!(mailer.sent_count(), 0);
        assert!(store.deliveries_for_sequence(id).unwrap().is_empty());

        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Error);
        assert_eq!(seq.error_message.as_deref(), Some("No recipients"));

        // Terminal: the next pass leaves it alone
        let again = runner.run_pass(Utc::now()).await.unwrap();
        assert_eq!(again.sent, 0);
        assert!(again.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recurrence_completes_after_dispatch() {
        let mailer = Arc::new(MockMailer::default());
        let (runner, store) = runner_with(mailer.clone(), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("odd", "<p>b</p>", now, "fortnightly")
            .unwrap();
        store.add_recipient(id, "a@x.com").unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        // The mail still goes out; the broken tag only ends the schedule
        assert_eq!(summary.sent, 1);
        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Completed);
    }

    #[tokio::test]
    async fn test_transport_failures_do_not_fail_the_sequence() {
        let mailer = Arc::new(MockMailer::failing_for(&["bad@x.com"]));
        let (runner, store) = runner_with(mailer.clone(), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("partial", "<p>b</p>", now, "once")
            .unwrap();
        store.add_recipient(id, "good@x.com").unwrap();
        store.add_recipient(id, "bad@x.com").unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert!(summary.errors.is_empty(), "per-recipient failures are not sequence errors");
        // The sequence still reaches its terminal state
        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Completed);
    }

    #[tokio::test]
    async fn test_already_claimed_sequence_is_skipped_silently() {
        let mailer = Arc::new(MockMailer::default());
        let (runner, store) = runner_with(mailer.clone(), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("contested", "<p>b</p>", now, "once")
            .unwrap();
        store.add_recipient(id, "a@x.com").unwrap();

        // Another worker wins the claim between our due-query and our claim
        assert!(store.claim(id).unwrap());

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert!(summary.errors.is_empty(), "a lost claim is not an error");
        assert_eq!(mailer.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_pass_deadline_leaves_work_for_next_run() {
        let mut config = test_config();
        config.dispatch.pass_deadline_secs = Some(0);
        let mailer = Arc::new(MockMailer::default());
        let (runner, store) = runner_with(mailer.clone(), &config);
        let now = Utc::now();
        let id = store
            .create_sequence("deferred", "<p>b</p>", now, "once")
            .unwrap();
        store.add_recipient(id, "a@x.com").unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 0);
        // Never claimed, so still eligible next pass
        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Pending);
    }

    /// File-backed store so a second raw connection can break the schema
    /// underneath the runner mid-test.
    fn file_store(name: &str) -> (Arc<MailStore>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "echomail-{name}-{}.db",
            uuid::Uuid::new_v4()
        ));
        (Arc::new(MailStore::open(&path).unwrap()), path)
    }

    fn remove_db(path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut p = path.as_os_str().to_owned();
            p.push(suffix);
            std::fs::remove_file(p).ok();
        }
    }

    #[tokio::test]
    async fn test_recipient_fetch_failure_releases_for_retry() {
        let (store, path) = file_store("fetch-fail");
        let mailer = Arc::new(MockMailer::default());
        let runner = SequenceRunner::new(store.clone(), mailer.clone(), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("broken", "<p>b</p>", now, "once")
            .unwrap();
        store.add_recipient(id, "a@x.com").unwrap();

        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute_batch("DROP TABLE sequence_recipients;").unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert!(
            summary.errors.get(&id).unwrap().contains("recipient fetch failed"),
            "got: {:?}",
            summary.errors
        );
        assert_eq!(mailer.sent_count(), 0);

        // Retryable, not terminal: back to pending, unlike the empty-list case
        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Pending);
        remove_db(&path);
    }

    #[tokio::test]
    async fn test_finalize_failure_releases_for_retry() {
        let (store, path) = file_store("finalize-fail");
        let mailer = Arc::new(MockMailer::default());
        let runner = SequenceRunner::new(store.clone(), mailer.clone(), &test_config());
        let now = Utc::now();
        let id = store
            .create_sequence("stuck", "<p>b</p>", now, "once")
            .unwrap();
        store.add_recipient(id, "a@x.com").unwrap();

        // Claiming (status = sending) and releasing (status = pending) stay
        // allowed; only the completion write fails.
        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute_batch(
            "CREATE TRIGGER block_completion BEFORE UPDATE ON email_sequences
             WHEN NEW.status = 'completed'
             BEGIN SELECT RAISE(ABORT, 'completion blocked'); END;",
        )
        .unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        // The mail went out before the store refused the terminal write
        assert_eq!(mailer.sent_count(), 1);
        assert_eq!(store.deliveries_for_sequence(id).unwrap().len(), 1);
        assert_eq!(summary.sent, 0);
        assert!(
            summary.errors.get(&id).unwrap().contains("finalize failed"),
            "got: {:?}",
            summary.errors
        );

        let seq = store.sequence(id).unwrap().unwrap();
        assert_eq!(seq.status, SequenceStatus::Pending);
        remove_db(&path);
    }

    #[tokio::test]
    async fn test_multiple_due_sequences_processed_in_one_pass() {
        let mailer = Arc::new(MockMailer::default());
        let (runner, store) = runner_with(mailer.clone(), &test_config());
        let now = Utc::now();

        let a = store.create_sequence("a", "<p>a</p>", now - ChronoDuration::minutes(2), "once").unwrap();
        let b = store.create_sequence("b", "<p>b</p>", now - ChronoDuration::minutes(1), "weekly").unwrap();
        store.add_recipient(a, "a@x.com").unwrap();
        store.add_recipient(b, "b@x.com").unwrap();
        // A third sequence with no recipients fails without aborting the pass
        let c = store.create_sequence("c", "<p>c</p>", now - ChronoDuration::minutes(3), "once").unwrap();

        let summary = runner.run_pass(now).await.unwrap();
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors.contains_key(&c));

        assert_eq!(store.sequence(a).unwrap().unwrap().status, SequenceStatus::Completed);
        assert_eq!(store.sequence(b).unwrap().unwrap().status, SequenceStatus::Pending);
        assert_eq!(store.sequence(c).unwrap().unwrap().status, SequenceStatus::Error);
    }
}
