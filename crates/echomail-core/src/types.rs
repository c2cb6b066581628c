//! Data model — sequences, recipients, and per-send delivery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A schedulable unit of mail: one subject/body sent to a recipient list.
///
/// Sequences are created externally; the engine only moves them through the
/// status state machine and reschedules recurring ones. The `id` is the one
/// stable identifier used for claiming, recipient lookup, and rescheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: i64,
    pub subject: String,
    /// Recipient-independent HTML body. The tracking pixel is appended per
    /// recipient at dispatch time.
    pub body: String,
    pub scheduled_at: DateTime<Utc>,
    /// Raw recurrence tag ("once", "daily", "weekly", "monthly", "yearly").
    /// Kept as text so an unrecognized tag survives a load round-trip and is
    /// treated as terminal when the next occurrence is computed.
    pub recurrence: String,
    pub status: SequenceStatus,
    pub error_message: Option<String>,
}

impl Sequence {
    /// Parsed recurrence, `None` for unknown tags.
    pub fn recurrence(&self) -> Option<Recurrence> {
        Recurrence::parse(&self.recurrence)
    }
}

/// Sequence lifecycle status.
///
/// Transitions: `pending → sending → {completed | pending | error}`.
/// `completed` and `error` are terminal for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    Pending,
    Sending,
    Completed,
    Error,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sending" => Self::Sending,
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// How often a sequence fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recurrence {
    Once,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Recurrence {
    /// Parse a recurrence tag. Unknown tags yield `None` and are treated as
    /// terminal by the lifecycle manager.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(Self::Once),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

/// An address attached to a sequence. Read-only from the engine's side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub sequence_id: i64,
    pub to_email: String,
}

/// One row per attempted send, created by the dispatcher at send time and
/// later flipped to `opened` by the tracking-pixel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Pre-generated UUID — known before the mail leaves so the tracking
    /// pixel URL can be embedded in the body.
    pub id: String,
    pub sequence_id: i64,
    pub to_email: String,
    /// Message id reported by the transport on acceptance.
    pub message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub opened: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked: bool,
    pub responded: bool,
    /// A/B variant tag, reserved for future use.
    pub variant: String,
}

impl DeliveryRecord {
    /// A fresh, unopened record for an attempted send.
    pub fn new(id: String, sequence_id: i64, to_email: &str, sent_at: DateTime<Utc>) -> Self {
        Self {
            id,
            sequence_id,
            to_email: to_email.to_string(),
            message_id: None,
            sent_at,
            opened: false,
            opened_at: None,
            clicked: false,
            responded: false,
            variant: "A".into(),
        }
    }
}
