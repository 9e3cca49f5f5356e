//! Wall-clock source for receipts, events and run ids.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Environment override pinning every timestamp the harness produces.
pub const NOW_OVERRIDE_ENV: &str = "HARNESS_NOW_ISO";

const UTC_Z_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub trait Clock: Send + Sync {
    /// Current time as `YYYY-MM-DDTHH:MM:SSZ`.
    fn now_utc(&self) -> String;
}

/// Real time, unless [`NOW_OVERRIDE_ENV`] is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> String {
        match std::env::var(NOW_OVERRIDE_ENV) {
            Ok(pinned) if !pinned.trim().is_empty() => pinned.trim().to_owned(),
            _ => format_utc(Utc::now()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock(String);

impl FixedClock {
    pub fn new(timestamp_utc: impl Into<String>) -> Self {
        Self(timestamp_utc.into())
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> String {
        self.0.clone()
    }
}

pub fn format_utc(at: DateTime<Utc>) -> String {
    at.format(UTC_Z_FORMAT).to_string()
}

/// True for exactly `YYYY-MM-DDTHH:MM:SSZ` with a valid calendar date.
pub fn is_utc_z_timestamp(value: &str) -> bool {
    value.len() == 20 && NaiveDateTime::parse_from_str(value, UTC_Z_FORMAT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_second_precision_with_z() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(format_utc(at), "2026-03-04T05:06:07Z");
    }

    #[test]
    fn validates_timestamp_shape() {
        assert!(is_utc_z_timestamp("2026-03-04T05:06:07Z"));
        assert!(!is_utc_z_timestamp("2026-03-04T05:06:07+00:00"));
        assert!(!is_utc_z_timestamp("2026-03-04T05:06:07.123Z"));
        assert!(!is_utc_z_timestamp("2026-13-04T05:06:07Z"));
        assert!(!is_utc_z_timestamp("2026-3-4T5:6:7Z"));
    }

    #[test]
    fn fixed_clock_is_stable() {
        let clock = FixedClock::new("2026-01-01T00:00:00Z");
        assert_eq!(clock.now_utc(), clock.now_utc());
    }

    #[test]
    fn system_clock_output_is_well_formed() {
        let now = SystemClock.now_utc();
        if std::env::var(NOW_OVERRIDE_ENV).is_err() {
            assert!(is_utc_z_timestamp(&now), "{now}");
        }
    }
}
