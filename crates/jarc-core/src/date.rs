//! Archive dates are 14-digit decimal `YYYYMMDDHHMMSS` values in UTC.
//! 0 encodes a deletion tombstone; anything outside 1900..3000 is rejected.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::error::{JarcError, Result};

pub const MIN_DATE: u64 = 19000101000000;
pub const MAX_DATE: u64 = 29991231235959;

/// Current wall clock as a decimal archive date.
pub fn now_decimal() -> u64 {
    decimal_from_datetime(&Utc::now())
}

pub fn decimal_from_datetime(t: &DateTime<Utc>) -> u64 {
    t.year() as u64 * 10_000_000_000
        + t.month() as u64 * 100_000_000
        + t.day() as u64 * 1_000_000
        + t.hour() as u64 * 10_000
        + t.minute() as u64 * 100
        + t.second() as u64
}

/// Convert seconds since the Unix epoch to a decimal date (0 for t <= 0).
pub fn decimal_from_unix(t: i64) -> u64 {
    match DateTime::<Utc>::from_timestamp(t, 0) {
        Some(dt) if t > 0 => decimal_from_datetime(&dt),
        _ => 0,
    }
}

/// Convert a decimal date back to seconds since the Unix epoch.
pub fn unix_from_decimal(date: u64) -> Result<i64> {
    let (y, mo, d) = (
        (date / 10_000_000_000) as i32,
        (date / 100_000_000 % 100) as u32,
        (date / 1_000_000 % 100) as u32,
    );
    let (h, mi, s) = (
        (date / 10_000 % 100) as u32,
        (date / 100 % 100) as u32,
        (date % 100) as u32,
    );
    NaiveDate::from_ymd_opt(y, mo, d)
        .and_then(|nd| nd.and_hms_opt(h, mi, s))
        .map(|ndt| ndt.and_utc().timestamp())
        .ok_or_else(|| JarcError::BadArchive(format!("invalid date {date}")))
}

pub fn is_valid(date: u64) -> bool {
    (MIN_DATE..=MAX_DATE).contains(&date) && unix_from_decimal(date).is_ok()
}

/// Render a date as `YYYY-MM-DD HH:MM:SS`; tombstones (0) and unknown or
/// out-of-range dates render as blanks.
pub fn date_to_string(date: u64) -> String {
    if date == 0 || date > MAX_DATE {
        return " ".repeat(19);
    }
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        date / 10_000_000_000,
        date / 100_000_000 % 100,
        date / 1_000_000 % 100,
        date / 10_000 % 100,
        date / 100 % 100,
        date % 100
    )
}

/// Widen an abbreviated `--until` date to a full 14-digit one.
///
/// `YYYYMMDD` becomes `YYYYMMDD235959`, `YYYYMMDDHH` becomes `…HH5959`, and
/// `YYYYMMDDHHMM` becomes `…HHMM59`, so a date-only cutoff includes every
/// snapshot taken that day.
pub fn widen_until_date(mut v: u64) -> u64 {
    if (19000000..=29991231).contains(&v) {
        v = v * 100 + 23;
    }
    if (1900000000..=2999123123).contains(&v) {
        v = v * 100 + 59;
    }
    if (190000000000..=299912312359).contains(&v) {
        v = v * 100 + 59;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_roundtrip() {
        let d = 20250102030405;
        let t = unix_from_decimal(d).unwrap();
        assert_eq!(decimal_from_unix(t), d);
    }

    #[test]
    fn unix_epoch_maps_to_zero() {
        assert_eq!(decimal_from_unix(0), 0);
        assert_eq!(decimal_from_unix(-5), 0);
    }

    #[test]
    fn rejects_impossible_dates() {
        assert!(unix_from_decimal(20250230000000).is_err()); // Feb 30
        assert!(!is_valid(20251301000000)); // month 13
        assert!(!is_valid(123));
    }

    #[test]
    fn renders_tombstone_blank() {
        assert_eq!(date_to_string(0).trim(), "");
        assert_eq!(date_to_string(20240131235958), "2024-01-31 23:59:58");
    }

    #[test]
    fn widen_fills_time_of_day() {
        assert_eq!(widen_until_date(20250101), 20250101235959);
        assert_eq!(widen_until_date(2025010112), 20250101125959);
        assert_eq!(widen_until_date(202501011234), 20250101123459);
        assert_eq!(widen_until_date(20250101123456), 20250101123456);
        // Version numbers are left alone.
        assert_eq!(widen_until_date(42), 42);
    }

    #[test]
    fn leap_second_free_increment_is_monotone() {
        let d = 20241231235959;
        let next = decimal_from_unix(unix_from_decimal(d).unwrap() + 1);
        assert_eq!(next, 20250101000000);
        assert!(next > d);
    }
}
