use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

/// Source of the current time, abstracted so the engine and lifecycle methods never call
/// `Utc::now()` directly. Production code uses [`SystemClock`]; tests substitute a fixed or
/// steppable clock (see `jobqueue-testing`).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Resolves the next occurrence of a cron expression at or after `after`, evaluated in `timezone`.
///
/// Returns `None` if the expression fails to parse or has no future occurrence in `timezone`.
/// A 6-field cron expression (seconds field first) is expected, matching the `cron` crate's
/// convention.
pub fn next_occurrence(expr: &str, timezone: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = Schedule::from_str(expr).ok()?;
    let tz: Tz = timezone.parse().ok()?;
    let after_tz = after.with_timezone(&tz);
    schedule
        .after(&after_tz)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Builds the worker identity recorded on every leased job: `hostname[pid]`, matching the
/// convention test suites use when they need a deterministic-enough process identity without a
/// discovery service.
pub fn default_worker_id() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    format!("{host}[{}]", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn next_occurrence_advances_past_after() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_occurrence("0 0 * * * *", "UTC", after).unwrap();
        assert!(next > after);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn next_occurrence_rejects_garbage_expressions() {
        let after = Utc::now();
        assert!(next_occurrence("not a cron expression", "UTC", after).is_none());
    }

    #[test]
    fn next_occurrence_rejects_unknown_timezone() {
        let after = Utc::now();
        assert!(next_occurrence("0 0 * * * *", "Nowhere/Imaginary", after).is_none());
    }
}
