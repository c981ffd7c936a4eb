use chrono::{DateTime, TimeDelta, Utc};

use crate::{AppError, AppResult};

/// Smallest step between two stored `date` values.
pub fn watermark_step() -> TimeDelta {
    TimeDelta::microseconds(1)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `date` columns are stored as UTC microseconds since the epoch.
pub fn to_micros(date: DateTime<Utc>) -> i64 {
    date.timestamp_micros()
}

pub fn from_micros(us: i64) -> AppResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(us).ok_or_else(|| {
        AppError::new("TIME/INVALID_TIMESTAMP", "Stored timestamp out of range")
            .with_context("micros", us.to_string())
    })
}

pub fn from_micros_opt(us: Option<i64>) -> AppResult<Option<DateTime<Utc>>> {
    us.map(from_micros).transpose()
}

/// Exclusive lower bound for the next incremental query: one step past the
/// newest contributing record. Saturates at the last representable instant.
pub fn watermark_after(latest: DateTime<Utc>) -> DateTime<Utc> {
    latest
        .checked_add_signed(watermark_step())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `watermark + guard`, the bound an appended record is compared against.
pub fn guarded(watermark: DateTime<Utc>, guard: TimeDelta) -> AppResult<DateTime<Utc>> {
    watermark.checked_add_signed(guard).ok_or_else(|| {
        AppError::new("TIME/OUT_OF_RANGE", "Watermark guard overflows the date range")
            .with_context("watermark", watermark.to_rfc3339())
            .with_context("guard_ms", guard.num_milliseconds().to_string())
    })
}

/// Record dates must leave room for a watermark and its guard.
pub fn is_storable_record_date(date: DateTime<Utc>) -> bool {
    date.checked_add_signed(TimeDelta::days(1)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn now_ms_is_reasonable() {
        let a = now_ms();
        assert!(a > 1_500_000_000_000); // after 2017
        assert!(a < 4_100_000_000_000); // before year ~2100
    }

    #[test]
    fn micros_survive_storage() {
        let date = Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap();
        let stored = to_micros(watermark_after(date));
        assert_eq!(stored, to_micros(date) + 1);
        assert_eq!(from_micros(stored).unwrap(), date + watermark_step());
    }

    #[test]
    fn watermark_saturates_at_the_end_of_time() {
        let last = DateTime::<Utc>::MAX_UTC;
        assert_eq!(watermark_after(last), last);
        assert!(!is_storable_record_date(last));
        assert!(is_storable_record_date(Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap()));
    }

    #[test]
    fn guard_overflow_is_an_error() {
        let err = guarded(DateTime::<Utc>::MAX_UTC, TimeDelta::milliseconds(1)).unwrap_err();
        assert_eq!(err.code(), "TIME/OUT_OF_RANGE");
        let date = Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(
            guarded(date, TimeDelta::milliseconds(1)).unwrap(),
            date + TimeDelta::milliseconds(1)
        );
    }

    #[test]
    fn absent_watermark_stays_absent() {
        assert_eq!(from_micros_opt(None).unwrap(), None);
    }
}
