// time.rs - injectable ISO-8601 UTC time source

use std::cell::Cell;

use chrono::{DateTime, SubsecRound, Utc};

thread_local! {
    static OVERRIDE: Cell<Option<DateTime<Utc>>> = const { Cell::new(None) };
}

/// Pins [`now_utc`]/[`now_iso`] to `at` for the calling thread until
/// [`clear_test_clock`] is called. The entity layer and every other caller
/// still just calls `now_iso()`/`now_utc()`; this is the injection point
/// tests use to force distinct or controlled instants instead of racing the
/// wall clock.
pub fn set_test_clock(at: DateTime<Utc>) {
    OVERRIDE.with(|cell| cell.set(Some(at.round_subsecs(3))));
}

/// Releases a clock pinned by [`set_test_clock`], returning to the real
/// wall clock for the calling thread.
pub fn clear_test_clock() {
    OVERRIDE.with(|cell| cell.set(None));
}

/// Returns the current instant, truncated to millisecond precision, formatted
/// as an ISO-8601 UTC string.
pub fn now_iso() -> String {
    now_utc().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Same instant as [`now_iso`] but as a `DateTime<Utc>`, for callers that need
/// to do arithmetic before formatting.
pub fn now_utc() -> DateTime<Utc> {
    OVERRIDE.with(|cell| cell.get()).unwrap_or_else(|| Utc::now().round_subsecs(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_iso_is_parseable_and_round_trips() {
        let s = now_iso();
        let parsed = DateTime::parse_from_rfc3339(&s).expect("valid rfc3339");
        assert_eq!(parsed.timezone().to_string(), "+00:00");
    }

    #[test]
    fn test_clock_pins_and_clears() {
        let fixed = "2025-06-01T12:00:00.000Z".parse::<DateTime<Utc>>().unwrap();
        set_test_clock(fixed);
        assert_eq!(now_utc(), fixed);
        assert_eq!(now_iso(), "2025-06-01T12:00:00.000Z");
        clear_test_clock();
        assert_ne!(now_utc(), fixed);
    }
}
