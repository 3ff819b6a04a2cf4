//! Time/Calendar
//!
//! All user-facing granularity uses a single configured UTC offset rather
//! than the server's local time zone, so bucket keys are stable regardless
//! of where the process runs.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

/// Renders `ts` (unix millis) at `offset_hours` as a `YYYY-MM-DD` string.
pub fn date_string(ts_millis: i64, offset_hours: i64) -> String {
    shifted(ts_millis, offset_hours).format("%Y-%m-%d").to_string()
}

/// Renders `ts` as `YYYY-MM-DD:HH`.
pub fn hour_string(ts_millis: i64, offset_hours: i64) -> String {
    shifted(ts_millis, offset_hours)
        .format("%Y-%m-%d:%H")
        .to_string()
}

/// Renders `ts` as `YYYY-MM`.
pub fn month_string(ts_millis: i64, offset_hours: i64) -> String {
    shifted(ts_millis, offset_hours).format("%Y-%m").to_string()
}

/// Renders `ts` as ISO-8601 week, `YYYY-Www`.
pub fn iso_week_string(ts_millis: i64, offset_hours: i64) -> String {
    let dt = shifted(ts_millis, offset_hours);
    let iso = dt.iso_week();
    format!("{:04}-W{:02}", iso.year(), iso.week())
}

fn shifted(ts_millis: i64, offset_hours: i64) -> DateTime<Utc> {
    let base = Utc.timestamp_millis_opt(ts_millis).single().unwrap_or_else(Utc::now);
    base + Duration::hours(offset_hours)
}

/// Start of the current rolling 7-day reset period for a key's
/// `weeklyResetDay` (1=Monday..7=Sunday, ISO) and `weeklyResetHour` (0-23),
/// evaluated at `ts`.
pub fn period_start_date(ts_millis: i64, offset_hours: i64, reset_day: u32, reset_hour: u32) -> DateTime<Utc> {
    let now = shifted(ts_millis, offset_hours);
    let reset_day = reset_day.clamp(1, 7);
    let reset_hour = reset_hour.min(23);

    let current_weekday = now.weekday().number_from_monday(); // 1..7
    let mut days_since_reset = (current_weekday as i64) - (reset_day as i64);
    if days_since_reset < 0 {
        days_since_reset += 7;
    }

    let mut candidate = now.date_naive() - Duration::days(days_since_reset);
    let mut period_start = candidate
        .and_hms_opt(reset_hour as u32, 0, 0)
        .unwrap()
        .and_utc();

    if period_start > now {
        candidate -= Duration::days(7);
        period_start = candidate
            .and_hms_opt(reset_hour as u32, 0, 0)
            .unwrap()
            .and_utc();
    }

    period_start
}

/// Key-safe label for the rolling period containing `ts`, e.g. `2026-07-27`.
pub fn period_string(ts_millis: i64, offset_hours: i64, reset_day: u32, reset_hour: u32) -> String {
    period_start_date(ts_millis, offset_hours, reset_day, reset_hour)
        .format("%Y-%m-%d")
        .to_string()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    #[test]
    fn date_string_basic() {
        assert_eq!(date_string(ts(2026, 7, 27, 12, 0, 0), 0), "2026-07-27");
    }

    #[test]
    fn hour_string_basic() {
        assert_eq!(hour_string(ts(2026, 7, 27, 9, 30, 0), 0), "2026-07-27:09");
    }

    #[test]
    fn weekly_period_roll() {
        // weeklyResetDay=1 (Monday), weeklyResetHour=0
        let mon_start = ts(2026, 7, 27, 0, 0, 1); // Monday 00:00:01
        let p1 = period_string(mon_start, 0, 1, 0);

        let sun_end = ts(2026, 8, 2, 23, 59, 59); // Sunday 23:59:59 of same period
        let p2 = period_string(sun_end, 0, 1, 0);
        assert_eq!(p1, p2);

        let next_mon = ts(2026, 8, 3, 0, 0, 1);
        let p3 = period_string(next_mon, 0, 1, 0);
        assert_ne!(p1, p3);
    }
}
