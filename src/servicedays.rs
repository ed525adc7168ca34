//! Transit service calendars as 64-bit day bitmaps.
//!
//! Bit `i` of a bitmap stands for `anchor + i` days. The anchor is the build
//! date the caller supplies, and the window is clamped to [`MAX_SERVICE_DAYS`]
//! days forward, so a departure's validity fits one u64. Start/end dates are
//! separately stored as day counts from the fixed [`PIVOT_DATE`].

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Timelike};

/// Longest service window a bitmap covers.
pub const MAX_SERVICE_DAYS: i64 = 60;

/// Epoch for stored day counts.
pub fn pivot_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2014, 1, 1).unwrap()
}

pub mod dow {
    pub const MONDAY: u8 = 1 << 0;
    pub const TUESDAY: u8 = 1 << 1;
    pub const WEDNESDAY: u8 = 1 << 2;
    pub const THURSDAY: u8 = 1 << 3;
    pub const FRIDAY: u8 = 1 << 4;
    pub const SATURDAY: u8 = 1 << 5;
    pub const SUNDAY: u8 = 1 << 6;
}

fn dow_bit(date: NaiveDate) -> u8 {
    1u8 << date.weekday().num_days_from_monday()
}

/// Days since [`pivot_date`], clamped at zero.
pub fn days_from_pivot(date: NaiveDate) -> u32 {
    (date - pivot_date()).num_days().max(0) as u32
}

/// Parse "HH:MM:SS" into seconds from midnight.
pub fn seconds_from_midnight(time: &str) -> Option<u32> {
    let t = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    Some(t.num_seconds_from_midnight())
}

pub fn parse_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Expand a service span into a day bitmap: every day in
/// [max(start, anchor), min(end, anchor + 59)] whose weekday is in the mask
/// gets its bit set.
pub fn get_service_days(anchor: NaiveDate, start: NaiveDate, end: NaiveDate, dow_mask: u8) -> u64 {
    let window_end = anchor + Duration::days(MAX_SERVICE_DAYS - 1);
    let lo = start.max(anchor);
    let hi = end.min(window_end);

    let mut days = 0u64;
    let mut date = lo;
    while date <= hi {
        if dow_bit(date) & dow_mask != 0 {
            let bit = (date - anchor).num_days();
            days |= 1u64 << bit;
        }
        date += Duration::days(1);
    }
    days
}

/// Clear the bit for an exception date, if it falls inside the service span
/// and the bitmap window.
pub fn remove_service_day(
    days: u64,
    anchor: NaiveDate,
    start: NaiveDate,
    end: NaiveDate,
    date: NaiveDate,
) -> u64 {
    if date < start || date > end {
        return days;
    }
    let bit = (date - anchor).num_days();
    if (0..MAX_SERVICE_DAYS).contains(&bit) {
        days & !(1u64 << bit)
    } else {
        days
    }
}

/// Set the bit for an added date, if it falls inside the service span and
/// the bitmap window.
pub fn add_service_day(
    days: u64,
    anchor: NaiveDate,
    start: NaiveDate,
    end: NaiveDate,
    date: NaiveDate,
) -> u64 {
    if date < start || date > end {
        return days;
    }
    let bit = (date - anchor).num_days();
    if (0..MAX_SERVICE_DAYS).contains(&bit) {
        days | (1u64 << bit)
    } else {
        days
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_seconds_from_midnight() {
        assert_eq!(seconds_from_midnight("00:00:00"), Some(0));
        assert_eq!(seconds_from_midnight("08:30:15"), Some(8 * 3600 + 30 * 60 + 15));
        assert_eq!(seconds_from_midnight("junk"), None);
    }

    #[test]
    fn test_mon_wed_fri_span_with_exceptions() {
        // Service 2017-01-02 (a Monday) through 2017-01-15, Mon/Wed/Fri,
        // 2017-01-07 (Saturday) added, 2017-01-09 (Monday) excepted.
        let anchor = date("2016-12-31");
        let start = date("2017-01-02");
        let end = date("2017-01-15");
        let mask = dow::MONDAY | dow::WEDNESDAY | dow::FRIDAY;

        let mut days = get_service_days(anchor, start, end, mask);
        days = remove_service_day(days, anchor, start, end, date("2017-01-09"));
        days = add_service_day(days, anchor, start, end, date("2017-01-07"));

        let expected: u64 = [2u64, 4, 6, 7, 11, 13].iter().map(|b| 1u64 << b).sum();
        assert_eq!(days, expected);
    }

    #[test]
    fn test_window_clamped_to_sixty_days() {
        let anchor = date("2017-01-01");
        let start = date("2016-06-01");
        let end = date("2018-06-01");
        let days = get_service_days(anchor, start, end, 0x7f);
        assert_eq!(days, u64::MAX >> (64 - MAX_SERVICE_DAYS));
    }

    #[test]
    fn test_past_service_is_empty() {
        let anchor = date("2017-06-01");
        let days = get_service_days(anchor, date("2017-01-01"), date("2017-02-01"), 0x7f);
        assert_eq!(days, 0);
    }

    #[test]
    fn test_added_date_outside_span_ignored() {
        let anchor = date("2017-01-01");
        let start = date("2017-01-02");
        let end = date("2017-01-05");
        let days = get_service_days(anchor, start, end, 0x7f);
        let same = add_service_day(days, anchor, start, end, date("2017-02-01"));
        assert_eq!(days, same);
    }

    #[test]
    fn test_days_from_pivot() {
        assert_eq!(days_from_pivot(pivot_date()), 0);
        assert_eq!(days_from_pivot(date("2014-01-31")), 30);
        assert_eq!(days_from_pivot(date("2013-06-01")), 0);
    }
}
