use crate::cursor::{self, Cursor};
use crate::model::RecordKind;
use chrono::{DateTime, Duration, Utc};
use fleet_sync_core::config::SyncConfig;
use fleet_sync_core::{Clock, Error, Result};
use metrics::counter;
use std::sync::Arc;
use tracing::warn;

/// Result of checking a cursor against the vendor's lookback window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCheck {
    pub is_valid: bool,
    pub parsed: Option<DateTime<Utc>>,
    pub age: Option<Duration>,
    pub limit: Duration,
}

/// Validity is inclusive: a cursor exactly `max_age` old is still accepted.
pub fn check_at(cursor: Option<&str>, max_age: Duration, now: DateTime<Utc>) -> WindowCheck {
    let parsed = cursor.and_then(cursor::decode);
    let age = parsed.map(|instant| now - instant);
    WindowCheck {
        is_valid: age.is_some_and(|age| age <= max_age),
        parsed,
        age,
        limit: max_age,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Missing,
    Invalid,
    Expired,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleReason::Missing => "missing",
            StaleReason::Invalid => "invalid",
            StaleReason::Expired => "expired",
        }
    }
}

pub struct Window {
    max_age: Duration,
    default_lookback: Duration,
    clock: Arc<dyn Clock>,
}

impl Window {
    pub fn new(max_age: Duration, default_lookback: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if default_lookback > max_age || default_lookback < Duration::zero() {
            return Err(Error::Config(format!(
                "default lookback of {} must be within the {} cursor window",
                cursor::format_age(default_lookback),
                cursor::format_age(max_age)
            )));
        }
        Ok(Self {
            max_age,
            default_lookback,
            clock,
        })
    }

    pub fn from_config(config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(
            Duration::days(config.max_age_days),
            Duration::hours(config.default_lookback_hours),
            clock,
        )
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn check(&self, cursor: Option<&Cursor>) -> WindowCheck {
        check_at(cursor.map(Cursor::as_str), self.max_age, self.clock.now())
    }

    /// Cursor for `now - default_lookback`.
    pub fn default_cursor(&self) -> Cursor {
        cursor::encode(&(self.clock.now() - self.default_lookback))
    }

    /// Returns `cursor` when it is inside the window, otherwise a fresh
    /// default-lookback cursor. Never returns an out-of-window cursor.
    pub fn ensure_within_window(&self, kind: RecordKind, cursor: Option<Cursor>) -> Cursor {
        let check = self.check(cursor.as_ref());
        if check.is_valid {
            if let Some(cursor) = cursor {
                return cursor;
            }
        }

        let reason = match (&cursor, check.age) {
            (None, _) => StaleReason::Missing,
            (Some(_), None) => StaleReason::Invalid,
            (Some(_), Some(_)) => StaleReason::Expired,
        };
        let fresh = self.default_cursor();

        warn!(
            kind = %kind,
            reason = reason.as_str(),
            stale = %cursor::short_form(cursor.as_ref().map(Cursor::as_str)),
            age = %check.age.map(cursor::format_age).unwrap_or_else(|| "n/a".to_string()),
            limit = %cursor::format_age(check.limit),
            replacement = %fresh,
            "Cursor outside the lookback window, resetting to default lookback"
        );
        counter!("fleet_sync_cursor_resets_total", "kind" => kind.as_str(), "reason" => reason.as_str())
            .increment(1);

        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_sync_core::FixedClock;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap()
    }

    fn window() -> Window {
        Window::new(Duration::days(7), Duration::hours(24), Arc::new(FixedClock(now()))).unwrap()
    }

    #[test]
    fn exact_limit_is_still_valid() {
        let check = check_at(Some("20240101000000000"), Duration::days(7), now());
        assert!(check.is_valid);
        assert_eq!(check.age, Some(Duration::days(7)));
        assert_eq!(check.limit, Duration::days(7));
    }

    #[test]
    fn older_than_limit_is_invalid_with_positive_age() {
        let check = check_at(Some("20231231235959000"), Duration::days(7), now());
        assert!(!check.is_valid);
        assert_eq!(check.age, Some(Duration::days(7) + Duration::seconds(1)));
        assert_eq!(
            check.parsed,
            Some(Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn undecodable_or_missing_is_invalid() {
        for cursor in [None, Some(""), Some("not-a-token")] {
            let check = check_at(cursor, Duration::days(7), now());
            assert!(!check.is_valid);
            assert_eq!(check.parsed, None);
            assert_eq!(check.age, None);
        }
    }

    #[test]
    fn max_age_is_configurable() {
        let check = check_at(Some("20240105000000000"), Duration::days(2), now());
        assert!(!check.is_valid);
    }

    #[test]
    fn absent_cursor_becomes_default_lookback() {
        let cursor = window().ensure_within_window(RecordKind::Trips, None);
        assert_eq!(cursor, cursor::encode(&(now() - Duration::hours(24))));
        assert_eq!(cursor.as_str(), "20240107000000000");
    }

    #[test]
    fn expired_and_invalid_cursors_are_replaced() {
        let window = window();
        for stale in ["20231201000000000", "garbage"] {
            let cursor = window.ensure_within_window(RecordKind::Events, Some(Cursor::new(stale)));
            assert_eq!(cursor.as_str(), "20240107000000000");
        }
    }

    #[test]
    fn valid_cursor_passes_through_unchanged() {
        let token = Cursor::new("20240105123456789");
        let cursor = window().ensure_within_window(RecordKind::Trips, Some(token.clone()));
        assert_eq!(cursor, token);
    }

    #[test]
    fn rejects_lookback_beyond_window() {
        let clock = Arc::new(FixedClock(now()));
        assert!(Window::new(Duration::days(1), Duration::hours(25), clock).is_err());
    }
}
