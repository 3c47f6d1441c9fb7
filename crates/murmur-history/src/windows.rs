use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use murmur_types::models::DateFilter;

use crate::{HistoryError, HistoryRequest};

const DATE_FORMAT: &str = "%Y-%m-%d";
const HOUR_FORMAT: &str = "%H:%M:%S%.f";
const MIN_YEAR: i32 = 1678;
const MAX_YEAR: i32 = 2261;

/// Time-of-day range applied to every requested day.
#[derive(Debug, Clone, Copy)]
struct DailyRange {
    start: NaiveTime,
    end: NaiveTime,
    /// Whole-day templates roll over when the bounds meet; explicit ranges
    /// only when the end comes first.
    roll_on_equal: bool,
}

/// Turn a history request into UTC windows, sorted by start.
///
/// Days run from `from` to `until` inclusive. Without `hours` each day is
/// covered by one window whose time of day is taken from the current UTC day
/// expressed in the requested zone. Window ends past `now` are clamped to it;
/// the first window starting after `now` ends the whole iteration.
pub fn resolve_windows(
    req: &HistoryRequest,
    now: DateTime<Utc>,
) -> Result<Vec<DateFilter>, HistoryError> {
    let from = parse_date(&req.from, "from")?;
    let until = parse_date(&req.until, "until")?;
    if from > until {
        return Err(HistoryError::InvalidRange);
    }

    let tz = zone(req.timezone.as_deref());
    let ranges = match req.hours.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        Some(hours) => parse_hours(hours)?,
        None => vec![whole_day(tz, now)],
    };

    let mut windows = Vec::new();
    'days: for day in from.iter_days().take_while(|day| *day <= until) {
        for range in &ranges {
            let start = local_instant(tz, day, range.start);
            let mut end = local_instant(tz, day, range.end);
            if end < start || (range.roll_on_equal && end == start) {
                end = local_instant(tz, day.succ_opt().unwrap_or(day), range.end);
            }

            if start > now {
                break 'days;
            }
            windows.push(DateFilter::between(start, end.min(now)));
        }
    }

    windows.sort_by_key(|w| w.start);
    Ok(windows)
}

fn parse_date(value: &str, param: &'static str) -> Result<NaiveDate, HistoryError> {
    let date = NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| HistoryError::InvalidDate(param))?;
    // Stored timestamps are i64 nanoseconds: 1677-09-21 to 2262-04-11.
    if !(MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        return Err(HistoryError::DateOutOfRange(param));
    }
    Ok(date)
}

/// Unknown or missing zones fall back to UTC.
fn zone(name: Option<&str>) -> Tz {
    name.map(str::trim)
        .filter(|name| !name.is_empty())
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC)
}

fn parse_hours(hours: &str) -> Result<Vec<DailyRange>, HistoryError> {
    hours
        .split(',')
        .map(|range| {
            let invalid = || HistoryError::InvalidHours(range.trim().to_string());
            let (start, end) = range.split_once('-').ok_or_else(invalid)?;
            Ok(DailyRange {
                start: parse_time(start).ok_or_else(invalid)?,
                end: parse_time(end).ok_or_else(invalid)?,
                roll_on_equal: false,
            })
        })
        .collect()
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), HOUR_FORMAT).ok()
}

/// Today's UTC day, 00:00:00 to 23:59:59.999999999, as wall-clock times in `tz`.
fn whole_day(tz: Tz, now: DateTime<Utc>) -> DailyRange {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let last = midnight + TimeDelta::days(1) - TimeDelta::nanoseconds(1);
    DailyRange {
        start: midnight.with_timezone(&tz).time(),
        end: last.with_timezone(&tz).time(),
        roll_on_equal: true,
    }
}

/// The instant `day` at `time` denotes in `tz`. Ambiguous wall-clock times take
/// the earlier instant; times inside a DST gap are pushed forward an hour.
fn local_instant(tz: Tz, day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let local = day.and_time(time);
    if let Some(t) = tz.from_local_datetime(&local).earliest() {
        return t.with_timezone(&Utc);
    }
    let shifted = local + TimeDelta::hours(1);
    match tz.from_local_datetime(&shifted).earliest() {
        Some(t) => t.with_timezone(&Utc),
        None => shifted.and_utc(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn request(from: &str, until: &str, hours: Option<&str>, timezone: Option<&str>) -> HistoryRequest {
        HistoryRequest {
            from: from.into(),
            until: until.into(),
            hours: hours.map(Into::into),
            timezone: timezone.map(Into::into),
            limit: 0,
        }
    }

    fn end_of_day(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        utc(y, mo, d, 23, 59)
            .with_second(59)
            .and_then(|t| t.with_nanosecond(999_999_999))
            .unwrap()
    }

    #[test]
    fn whole_days_stop_at_now() {
        let req = request("2023-01-01", "2023-01-03", None, None);
        let now = utc(2023, 1, 2, 10, 0);
        let windows = resolve_windows(&req, now).unwrap();
        assert_eq!(
            windows,
            [
                DateFilter::between(utc(2023, 1, 1, 0, 0), end_of_day(2023, 1, 1)),
                DateFilter::between(utc(2023, 1, 2, 0, 0), now),
            ]
        );
    }

    #[test]
    fn hours_crossing_midnight_roll_into_next_day() {
        let req = request("2023-01-01", "2023-01-01", Some("09:00:00-08:00:00"), None);
        let windows = resolve_windows(&req, utc(2023, 6, 1, 0, 0)).unwrap();
        assert_eq!(
            windows,
            [DateFilter::between(utc(2023, 1, 1, 9, 0), utc(2023, 1, 2, 8, 0))]
        );
    }

    #[test]
    fn start_equal_to_now_is_kept() {
        let now = utc(2023, 1, 1, 9, 0);
        let req = request("2023-01-01", "2023-01-02", Some("09:00:00-10:00:00"), None);
        let windows = resolve_windows(&req, now).unwrap();
        assert_eq!(windows, [DateFilter::between(now, now)]);
    }

    #[test]
    fn multiple_ranges_are_sorted_by_start() {
        let req = request(
            "2023-01-01",
            "2023-01-02",
            Some("18:00:00-19:00:00, 09:00:00.5-10:00:00"),
            None,
        );
        let windows = resolve_windows(&req, utc(2023, 6, 1, 0, 0)).unwrap();
        let starts: Vec<_> = windows.iter().map(|w| w.start.unwrap()).collect();
        assert_eq!(
            starts,
            [
                utc(2023, 1, 1, 9, 0) + TimeDelta::milliseconds(500),
                utc(2023, 1, 1, 18, 0),
                utc(2023, 1, 2, 9, 0) + TimeDelta::milliseconds(500),
                utc(2023, 1, 2, 18, 0),
            ]
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        let now = utc(2023, 6, 1, 0, 0);
        for hours in ["9-10", "09:00:00", "09:00:00-25:00:00", "09:00:00-10:00:00,"] {
            let req = request("2023-01-01", "2023-01-01", Some(hours), None);
            assert!(
                matches!(resolve_windows(&req, now), Err(HistoryError::InvalidHours(_))),
                "{hours}"
            );
        }

        let req = request("2023-1-x", "2023-01-01", None, None);
        assert!(matches!(resolve_windows(&req, now), Err(HistoryError::InvalidDate("from"))));
        let req = request("2023-01-01", "", None, None);
        assert!(matches!(resolve_windows(&req, now), Err(HistoryError::InvalidDate("until"))));
        let req = request("2023-01-02", "2023-01-01", None, None);
        assert!(matches!(resolve_windows(&req, now), Err(HistoryError::InvalidRange)));
    }

    #[test]
    fn dates_beyond_storable_years_are_rejected() {
        let now = utc(2023, 6, 1, 0, 0);
        let req = request("1500-01-01", "2023-01-01", None, None);
        assert!(matches!(
            resolve_windows(&req, now),
            Err(HistoryError::DateOutOfRange("from"))
        ));
        let req = request("2023-01-01", "9999-12-31", None, None);
        assert!(matches!(
            resolve_windows(&req, now),
            Err(HistoryError::DateOutOfRange("until"))
        ));

        let req = request("1678-01-01", "1678-01-01", None, None);
        let windows = resolve_windows(&req, now).unwrap();
        assert!(windows[0].start.unwrap().timestamp_nanos_opt().is_some());
    }

    #[test]
    fn future_range_has_no_windows() {
        let req = request("2023-02-01", "2023-02-05", None, None);
        assert!(resolve_windows(&req, utc(2023, 1, 1, 0, 0)).unwrap().is_empty());
    }

    #[test]
    fn hours_are_read_in_the_requested_zone() {
        let req = request("2023-01-01", "2023-01-01", Some("09:00:00-17:00:00"), Some("Asia/Tokyo"));
        let windows = resolve_windows(&req, utc(2023, 6, 1, 0, 0)).unwrap();
        assert_eq!(
            windows,
            [DateFilter::between(utc(2023, 1, 1, 0, 0), utc(2023, 1, 1, 8, 0))]
        );
    }

    #[test]
    fn whole_day_template_follows_utc_day() {
        // UTC midnight is 09:00 in Tokyo; the template end rolls into the next local day.
        let req = request("2023-01-01", "2023-01-01", None, Some("Asia/Tokyo"));
        let windows = resolve_windows(&req, utc(2023, 6, 1, 0, 0)).unwrap();
        assert_eq!(
            windows,
            [DateFilter::between(utc(2023, 1, 1, 0, 0), end_of_day(2023, 1, 1))]
        );
    }

    #[test]
    fn unknown_zone_falls_back_to_utc() {
        let req = request("2023-01-01", "2023-01-01", Some("09:00:00-10:00:00"), Some("Mars/Olympus"));
        let windows = resolve_windows(&req, utc(2023, 6, 1, 0, 0)).unwrap();
        assert_eq!(
            windows,
            [DateFilter::between(utc(2023, 1, 1, 9, 0), utc(2023, 1, 1, 10, 0))]
        );
    }

    #[test]
    fn dst_gap_and_overlap() {
        // 02:30 does not exist on 2023-03-12 in New York; 03:30 EDT is 07:30Z.
        let req = request("2023-03-12", "2023-03-12", Some("02:30:00-04:00:00"), Some("America/New_York"));
        let windows = resolve_windows(&req, utc(2023, 6, 1, 0, 0)).unwrap();
        assert_eq!(
            windows,
            [DateFilter::between(utc(2023, 3, 12, 7, 30), utc(2023, 3, 12, 8, 0))]
        );

        // 01:30 happens twice on 2023-11-05; the EDT one (05:30Z) comes first.
        let req = request("2023-11-05", "2023-11-05", Some("01:30:00-03:00:00"), Some("America/New_York"));
        let windows = resolve_windows(&req, utc(2023, 12, 1, 0, 0)).unwrap();
        assert_eq!(
            windows,
            [DateFilter::between(utc(2023, 11, 5, 5, 30), utc(2023, 11, 5, 8, 0))]
        );
    }
}
