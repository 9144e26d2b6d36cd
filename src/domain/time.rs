//! Epoch-millisecond time helpers for analytics request ranges

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};

/// Current time in epoch milliseconds
#[inline]
pub fn current_utc() -> i64 {
    Utc::now().timestamp_millis()
}

/// Local midnight of `now`, in epoch milliseconds
pub fn start_of_day_utc_at<Tz: TimeZone>(now: &DateTime<Tz>) -> i64 {
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    now.timezone()
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis())
}

/// Local midnight today, in epoch milliseconds
pub fn start_of_day_utc() -> i64 {
    start_of_day_utc_at(&Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_of_day_utc_at() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 15, 30, 12).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(start_of_day_utc_at(&now), expected);
    }
}
