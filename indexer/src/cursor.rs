//! Since-token codec.
//!
//! A cursor is `YYYYMMDDHHMMSS` in UTC followed by a constant three digit
//! suffix the vendor requires. Only the first 14 characters carry meaning;
//! server-issued tokens are stored verbatim.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Write};

pub const CURSOR_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
const CURSOR_TIME_LEN: usize = 14;
const CURSOR_SUFFIX: &str = "000";

/// Rendering used for diagnostics when no explicit format is requested.
pub const HUMAN_FORMAT: &str = "%d/%m/%Y %H:%M:%S";
/// Returned by [`render_human`] for anything that does not decode.
pub const INVALID_MARKER: &str = "invalid";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wraps a raw token without validating it; see [`Cursor::instant`].
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        decode(&self.0)
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encodes an instant from any timezone as a UTC cursor.
pub fn encode<Tz: TimeZone>(instant: &DateTime<Tz>) -> Cursor {
    let utc = instant.with_timezone(&Utc);
    Cursor(format!("{}{}", utc.format(CURSOR_TIME_FORMAT), CURSOR_SUFFIX))
}

/// Decodes the instant in a cursor. Total: malformed or missing input yields `None`.
pub fn decode(raw: &str) -> Option<DateTime<Utc>> {
    let prefix = raw.get(..CURSOR_TIME_LEN)?;
    if !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(prefix, CURSOR_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Cursor for `now - hours_back`, or `None` when that instant falls outside
/// the four-digit years the format can carry.
pub fn relative(now: DateTime<Utc>, hours_back: i64) -> Option<Cursor> {
    let instant = now.checked_sub_signed(Duration::try_hours(hours_back)?)?;
    (1..=9999).contains(&instant.year()).then(|| encode(&instant))
}

/// Best-effort local rendering of a cursor; never fails.
pub fn render_human<Tz>(cursor: Option<&str>, tz: &Tz, format: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let Some(instant) = cursor.and_then(decode) else {
        return INVALID_MARKER.to_string();
    };

    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return INVALID_MARKER.to_string();
    }

    let mut rendered = String::new();
    let local = instant.with_timezone(tz);
    match write!(rendered, "{}", local.format_with_items(StrftimeItems::new(format))) {
        Ok(()) => rendered,
        Err(_) => INVALID_MARKER.to_string(),
    }
}

/// Compact age such as `2d 3h 15m`, `4h 0m` or `12m`.
pub fn format_age(delta: Duration) -> String {
    let sign = if delta < Duration::zero() { "-" } else { "" };
    let total_minutes = delta.num_minutes().unsigned_abs();
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;

    let mut parts = Vec::with_capacity(3);
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 || days > 0 {
        parts.push(format!("{hours}h"));
    }
    parts.push(format!("{minutes}m"));
    format!("{sign}{}", parts.join(" "))
}

/// Abbreviated token for log lines.
pub fn short_form(cursor: Option<&str>) -> String {
    let Some(raw) = cursor.filter(|c| !c.is_empty()) else {
        return "empty".to_string();
    };
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 10 {
        return raw.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail} (len={})", chars.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn encodes_with_fixed_suffix() {
        assert_eq!(encode(&utc(2024, 1, 1, 0, 0, 0)).as_str(), "20240101000000000");
        assert_eq!(encode(&utc(2025, 12, 10, 8, 5, 9)).as_str(), "20251210080509000");
    }

    #[test]
    fn encode_normalizes_to_utc() {
        let manaus = FixedOffset::west_opt(4 * 3600).unwrap();
        let local = manaus.with_ymd_and_hms(2024, 1, 1, 22, 30, 0).unwrap();
        assert_eq!(encode(&local).as_str(), "20240102023000000");
    }

    #[test]
    fn encode_drops_subsecond_precision() {
        let instant = utc(2024, 3, 4, 5, 6, 7) + Duration::milliseconds(987);
        assert_eq!(encode(&instant).as_str(), "20240304050607000");
    }

    #[test]
    fn decodes_server_tokens_by_prefix() {
        assert_eq!(decode("20240101010000123"), Some(utc(2024, 1, 1, 1, 0, 0)));
        assert_eq!(decode("20240101010000"), Some(utc(2024, 1, 1, 1, 0, 0)));
    }

    #[test]
    fn rejects_malformed_tokens() {
        for raw in [
            "",
            "2024",
            "2024010100000",
            "20241301000000000",
            "20240230000000000",
            "2024-01-01T00:00",
            "+2024010100000000",
            " 20240101000000",
            "abcdefghijklmnopq",
            "2024010100000é",
        ] {
            assert_eq!(decode(raw), None, "{raw:?} should not decode");
        }
    }

    #[test]
    fn relative_cursor_counts_back_from_now() {
        let now = utc(2024, 6, 2, 12, 0, 0);
        assert_eq!(relative(now, 24).unwrap().as_str(), "20240601120000000");
        assert_eq!(relative(now, 0).unwrap().as_str(), "20240602120000000");
    }

    #[test]
    fn relative_cursor_out_of_range_is_none() {
        let now = utc(2024, 6, 2, 12, 0, 0);
        assert_eq!(relative(now, 10_000_000_000), None);
        assert_eq!(relative(now, i64::MAX), None);
        assert_eq!(relative(now, i64::MIN), None);
    }

    #[test]
    fn renders_in_requested_timezone() {
        let manaus = FixedOffset::west_opt(4 * 3600).unwrap();
        assert_eq!(
            render_human(Some("20240102023000000"), &manaus, HUMAN_FORMAT),
            "01/01/2024 22:30:00"
        );
        assert_eq!(
            render_human(Some("20240102023000000"), &Utc, "%Y-%m-%d %H:%M"),
            "2024-01-02 02:30"
        );
    }

    #[test]
    fn render_falls_back_to_marker() {
        assert_eq!(render_human(None, &Utc, HUMAN_FORMAT), INVALID_MARKER);
        assert_eq!(render_human(Some("garbage"), &Utc, HUMAN_FORMAT), INVALID_MARKER);
        assert_eq!(
            render_human(Some("20240101000000000"), &Utc, "%Y %Q"),
            INVALID_MARKER
        );
    }

    #[test]
    fn formats_ages() {
        assert_eq!(format_age(Duration::minutes(12)), "12m");
        assert_eq!(format_age(Duration::hours(4)), "4h 0m");
        assert_eq!(format_age(Duration::days(7)), "7d 0h 0m");
        assert_eq!(
            format_age(Duration::days(2) + Duration::hours(3) + Duration::minutes(15)),
            "2d 3h 15m"
        );
        assert_eq!(format_age(Duration::minutes(-90)), "-1h 30m");
    }

    #[test]
    fn shortens_long_tokens() {
        assert_eq!(short_form(None), "empty");
        assert_eq!(short_form(Some("")), "empty");
        assert_eq!(short_form(Some("2024010100")), "2024010100");
        assert_eq!(short_form(Some("20240101000000000")), "202401...0000 (len=17)");
    }

    proptest! {
        #[test]
        fn roundtrips_to_second_precision(secs in 0i64..253_402_300_799, nanos in 0u32..1_000_000_000) {
            let instant = DateTime::<Utc>::from_timestamp(secs, nanos).unwrap();
            let decoded = decode(encode(&instant).as_str()).unwrap();
            prop_assert_eq!(decoded.timestamp(), secs);
        }

        #[test]
        fn roundtrips_from_any_offset(secs in 0i64..253_402_200_000, offset_mins in -720i32..=720) {
            let tz = FixedOffset::east_opt(offset_mins * 60).unwrap();
            let instant = DateTime::<Utc>::from_timestamp(secs, 0).unwrap().with_timezone(&tz);
            prop_assert_eq!(decode(encode(&instant).as_str()).unwrap().timestamp(), secs);
        }

        #[test]
        fn decode_is_total(raw in "\\PC{0,40}") {
            let _ = decode(&raw);
            let _ = render_human(Some(&raw), &Utc, HUMAN_FORMAT);
        }

        #[test]
        fn non_digit_in_prefix_is_invalid(head in "[0-9]{0,13}", bad in "[^0-9]", tail in "[0-9]{0,16}") {
            let raw = format!("{head}{bad}{tail}");
            prop_assert_eq!(decode(&raw), None);
        }
    }
}
