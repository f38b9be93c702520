//! Civil-time helpers — local calendar dates and wall-clock times to UTC.
//!
//! Every conversion uses the offset in force on the target date, never the
//! offset of "now", so DST transitions between generation time and the
//! scheduled day are handled correctly.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Longest DST gap we will step over (Lord Howe is 30 min, most zones 1h).
const MAX_GAP_MINUTES: i64 = 180;

/// Convert a local wall-clock time on a local date to a UTC instant.
///
/// - A unique local time maps directly.
/// - An ambiguous time (fall-back overlap) resolves to the earlier instant.
/// - A nonexistent time (spring-forward gap) moves to the first valid local
///   minute after the gap.
///
/// Returns `None` only if no valid minute exists within `MAX_GAP_MINUTES`.
pub fn local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    for shift in 0..=MAX_GAP_MINUTES {
        let candidate = naive + Duration::minutes(shift);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => continue,
        }
    }
    None
}

/// The UTC instant at which `date` begins in `tz`.
pub fn local_day_start(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    local_to_utc(tz, date, NaiveTime::from_hms_opt(0, 0, 0)?)
}

/// The calendar date `now` falls on in `tz`.
pub fn local_today(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// The calendar date an instant falls on in `tz`.
pub fn local_date_of(tz: Tz, instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Parse an IANA zone id.
pub fn parse_tz(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn uses_target_date_offset_across_spring_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // Day before the transition is still EST (-05:00).
        let before = local_to_utc(tz, date(2024, 3, 9), time(7, 0)).unwrap();
        assert_eq!(before.to_rfc3339(), "2024-03-09T12:00:00+00:00");
        // Transition day morning is EDT (-04:00).
        let after = local_to_utc(tz, date(2024, 3, 10), time(7, 0)).unwrap();
        assert_eq!(after.to_rfc3339(), "2024-03-10T11:00:00+00:00");
    }

    #[test]
    fn gap_moves_forward_to_first_valid_minute() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let dt = local_to_utc(tz, date(2024, 3, 10), time(2, 30)).unwrap();
        let local = dt.with_timezone(&tz);
        assert_eq!(local.time(), time(3, 0));
    }

    #[test]
    fn ambiguous_resolves_to_earlier_instant() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let dt = local_to_utc(tz, date(2024, 11, 3), time(1, 30)).unwrap();
        // First 01:30 is still EDT.
        assert_eq!(dt.to_rfc3339(), "2024-11-03T05:30:00+00:00");
    }

    #[test]
    fn local_today_differs_from_utc_date_near_midnight() {
        let tz: Tz = "Pacific/Auckland".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap();
        assert_eq!(local_today(tz, now), date(2024, 6, 2));
        let tz: Tz = "America/Los_Angeles".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
        assert_eq!(local_today(tz, now), date(2024, 5, 31));
    }

    #[test]
    fn parse_tz_rejects_garbage() {
        assert!(parse_tz("Mars/Olympus_Mons").is_none());
        assert_eq!(parse_tz(" Europe/Paris "), Some(chrono_tz::Europe::Paris));
    }
}
