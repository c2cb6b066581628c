//! Recurrence calculator — pure calendar arithmetic, UTC only.

use chrono::{DateTime, Duration, Months, Utc};

use echomail_core::types::Recurrence;

/// Upper bound on catch-up increments, so a degenerate schedule (e.g. a
/// zero-width step after clock skew) can never loop forever.
const MAX_CATCH_UP_STEPS: u32 = 1000;

/// Compute the next occurrence strictly after `now`.
///
/// Returns `None` for `once` and for unrecognized recurrence tags — the
/// caller treats both as terminal. When a run was missed, the increment is
/// repeated until the result lands in the future, so a catch-up pass never
/// reschedules a sequence into the past and immediately re-fires it.
///
/// Monthly and yearly steps use calendar months: overflow days clamp to the
/// end of the shorter month (Jan 31 + 1 month = Feb 28/29).
pub fn next_occurrence(
    scheduled_at: DateTime<Utc>,
    recurrence: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let recurrence = Recurrence::parse(recurrence)?;

    let mut next = scheduled_at;
    for _ in 0..MAX_CATCH_UP_STEPS {
        next = step(next, recurrence)?;
        if next > now {
            return Some(next);
        }
    }
    tracing::warn!(
        "Gave up advancing {} recurrence from {scheduled_at} after {MAX_CATCH_UP_STEPS} steps",
        recurrence.as_str()
    );
    None
}

fn step(t: DateTime<Utc>, recurrence: Recurrence) -> Option<DateTime<Utc>> {
    match recurrence {
        Recurrence::Once => None,
        Recurrence::Daily => t.checked_add_signed(Duration::days(1)),
        Recurrence::Weekly => t.checked_add_signed(Duration::days(7)),
        Recurrence::Monthly => t.checked_add_months(Months::new(1)),
        Recurrence::Yearly => t.checked_add_months(Months::new(12)),
    }
}
