//! SQLite-backed mail store.
//!
//! Follows the same conventions as the rest of the stack: a `Mutex` around
//! one connection, WAL mode, `CREATE TABLE IF NOT EXISTS` migrations, and
//! RFC 3339 TEXT timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

use echomail_core::error::{EchomailError, Result};
use echomail_core::types::{DeliveryRecord, Recipient, Sequence, SequenceStatus};

/// Durable store for sequences, recipients, and delivery records.
pub struct MailStore {
    conn: Mutex<Connection>,
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            // Corrupt rows stay readable, but loudly: the substituted "now"
            // keeps a pending sequence due until the row is fixed.
            tracing::warn!("Unparseable stored timestamp {s:?}: {e}");
            Utc::now()
        })
}

impl MailStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .map_err(|e| EchomailError::Store(format!("DB open: {e}")))?;
        // WAL for better concurrent read behavior
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EchomailError::Store(format!("DB open: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EchomailError::Store(format!("Lock: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS email_sequences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                recurrence TEXT NOT NULL DEFAULT 'once',
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sequence_recipients (
                sequence_id INTEGER NOT NULL,
                to_email TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_sequence
                ON sequence_recipients(sequence_id);

            CREATE TABLE IF NOT EXISTS emails_sent (
                id TEXT PRIMARY KEY,
                sequence_id INTEGER NOT NULL,
                to_email TEXT NOT NULL,
                message_id TEXT,
                sent_at TEXT NOT NULL,
                opened INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT,
                clicked INTEGER NOT NULL DEFAULT 0,
                responded INTEGER NOT NULL DEFAULT 0,
                variant TEXT NOT NULL DEFAULT 'A'
            );
            CREATE INDEX IF NOT EXISTS idx_emails_sent_sequence
                ON emails_sent(sequence_id);
        ",
        )
        .map_err(|e| EchomailError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    // ── Sequences ──────────────────────────────

    /// Create a sequence in `pending` state. Returns its id.
    pub fn create_sequence(
        &self,
        subject: &str,
        body: &str,
        scheduled_at: DateTime<Utc>,
        recurrence: &str,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO email_sequences (subject, body, scheduled_at, recurrence, status)
             VALUES (?1, ?2, ?3, ?4, 'pending')",
            params![subject, body, fmt_ts(scheduled_at), recurrence],
        )
        .map_err(|e| EchomailError::Store(format!("Create sequence: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch a single sequence.
    pub fn sequence(&self, id: i64) -> Result<Option<Sequence>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, subject, body, scheduled_at, recurrence, status, error_message
             FROM email_sequences WHERE id = ?1",
            params![id],
            Self::row_to_sequence,
        )
        .optional()
        .map_err(|e| EchomailError::Store(format!("Get sequence: {e}")))
    }

    /// All sequences due at `now`: `status = pending AND scheduled_at <= now`.
    pub fn due_sequences(&self, now: DateTime<Utc>) -> Result<Vec<Sequence>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, subject, body, scheduled_at, recurrence, status, error_message
                 FROM email_sequences
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at",
            )
            .map_err(|e| EchomailError::Store(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![fmt_ts(now)], Self::row_to_sequence)
            .map_err(|e| EchomailError::Store(format!("Query: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Atomic claim: `pending → sending`, guarded by the prior status in the
    /// same UPDATE. Returns false when another worker got there first — the
    /// affected-row count is trusted as the sole claim signal, no re-read.
    pub fn claim(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE email_sequences
                 SET status = 'sending', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![fmt_ts(Utc::now()), id],
            )
            .map_err(|e| EchomailError::Store(format!("Claim: {e}")))?;
        Ok(affected == 1)
    }

    /// Terminal: mark a sequence completed.
    pub fn complete(&self, id: i64) -> Result<()> {
        self.set_status(id, SequenceStatus::Completed, None)
    }

    /// Return a claimed sequence to `pending` so the next pass retries it.
    pub fn release(&self, id: i64) -> Result<()> {
        self.set_status(id, SequenceStatus::Pending, None)
    }

    /// Terminal: mark a sequence failed with a reason (e.g. no recipients).
    pub fn mark_error(&self, id: i64, message: &str) -> Result<()> {
        self.set_status(id, SequenceStatus::Error, Some(message))
    }

    /// Reschedule a recurring sequence: back to `pending` at the next
    /// occurrence.
    pub fn reschedule(&self, id: i64, next: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE email_sequences
             SET status = 'pending', scheduled_at = ?1, error_message = NULL, updated_at = ?2
             WHERE id = ?3",
            params![fmt_ts(next), fmt_ts(Utc::now()), id],
        )
        .map_err(|e| EchomailError::Store(format!("Reschedule: {e}")))?;
        Ok(())
    }

    fn set_status(&self, id: i64, status: SequenceStatus, message: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE email_sequences
             SET status = ?1, error_message = ?2, updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), message, fmt_ts(Utc::now()), id],
        )
        .map_err(|e| EchomailError::Store(format!("Set status: {e}")))?;
        Ok(())
    }

    fn row_to_sequence(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sequence> {
        let status: String = row.get(5)?;
        let scheduled_at: String = row.get(3)?;
        Ok(Sequence {
            id: row.get(0)?,
            subject: row.get(1)?,
            body: row.get(2)?,
            scheduled_at: parse_ts(&scheduled_at),
            recurrence: row.get(4)?,
            status: SequenceStatus::parse(&status),
            error_message: row.get(6)?,
        })
    }

    // ── Recipients ──────────────────────────────

    /// Attach a recipient address to a sequence.
    pub fn add_recipient(&self, sequence_id: i64, to_email: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sequence_recipients (sequence_id, to_email) VALUES (?1, ?2)",
            params![sequence_id, to_email],
        )
        .map_err(|e| EchomailError::Store(format!("Add recipient: {e}")))?;
        Ok(())
    }

    /// Recipient list for a sequence, in insertion order.
    pub fn recipients(&self, sequence_id: i64) -> Result<Vec<Recipient>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence_id, to_email FROM sequence_recipients
                 WHERE sequence_id = ?1 ORDER BY rowid",
            )
            .map_err(|e| EchomailError::Store(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![sequence_id], |row| {
                Ok(Recipient {
                    sequence_id: row.get(0)?,
                    to_email: row.get(1)?,
                })
            })
            .map_err(|e| EchomailError::Store(format!("Query: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Delivery records ──────────────────────────────

    /// Insert a delivery record. Ids are pre-generated by the dispatcher, so
    /// every insert targets a fresh key.
    pub fn insert_delivery(&self, rec: &DeliveryRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO emails_sent
             (id, sequence_id, to_email, message_id, sent_at, opened, opened_at, clicked, responded, variant)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rec.id,
                rec.sequence_id,
                rec.to_email,
                rec.message_id,
                fmt_ts(rec.sent_at),
                rec.opened as i32,
                rec.opened_at.map(fmt_ts),
                rec.clicked as i32,
                rec.responded as i32,
                rec.variant,
            ],
        )
        .map_err(|e| EchomailError::Store(format!("Insert delivery: {e}")))?;
        Ok(())
    }

    /// Fetch a delivery record by id.
    pub fn delivery(&self, id: &str) -> Result<Option<DeliveryRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, sequence_id, to_email, message_id, sent_at, opened, opened_at, clicked, responded, variant
             FROM emails_sent WHERE id = ?1",
            params![id],
            Self::row_to_delivery,
        )
        .optional()
        .map_err(|e| EchomailError::Store(format!("Get delivery: {e}")))
    }

    /// All delivery records for one sequence.
    pub fn deliveries_for_sequence(&self, sequence_id: i64) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, sequence_id, to_email, message_id, sent_at, opened, opened_at, clicked, responded, variant
                 FROM emails_sent WHERE sequence_id = ?1 ORDER BY sent_at",
            )
            .map_err(|e| EchomailError::Store(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![sequence_id], Self::row_to_delivery)
            .map_err(|e| EchomailError::Store(format!("Query: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// First-hit-wins open tracking: flips `opened` and stamps `opened_at`
    /// only when the record is still unopened. Repeat hits and unknown ids
    /// are no-ops (returns false).
    pub fn mark_opened(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE emails_sent SET opened = 1, opened_at = ?1
                 WHERE id = ?2 AND opened = 0",
                params![fmt_ts(now), id],
            )
            .map_err(|e| EchomailError::Store(format!("Mark opened: {e}")))?;
        Ok(affected == 1)
    }

    fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRecord> {
        let sent_at: String = row.get(4)?;
        let opened_at: Option<String> = row.get(6)?;
        Ok(DeliveryRecord {
            id: row.get(0)?,
            sequence_id: row.get(1)?,
            to_email: row.get(2)?,
            message_id: row.get(3)?,
            sent_at: parse_ts(&sent_at),
            opened: row.get::<_, i32>(5)? != 0,
            opened_at: opened_at.as_deref().map(parse_ts),
            clicked: row.get::<_, i32>(7)? != 0,
            responded: row.get::<_, i32>(8)? != 0,
            variant: row.get(9)?,
        })
    }
}
