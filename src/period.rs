//! Period arithmetic for the candle/metrics roll-up hierarchy.
//!
//! A `Period` identifies one tier of the fusion hierarchy. All bucket
//! boundaries are anchored in UTC; there is no notion of a local-time
//! trading day anywhere in this module.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::EngineError;

/// One tier of the candle/metrics roll-up hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1m")]
    OneM,
    #[serde(rename = "5m")]
    FiveM,
    #[serde(rename = "15m")]
    FifteenM,
    #[serde(rename = "1h")]
    OneH,
    #[serde(rename = "4h")]
    FourH,
    #[serde(rename = "1d")]
    OneD,
    #[serde(rename = "1w")]
    OneW,
}

impl Period {
    /// All bar periods, base first, coarsest last.
    pub const BAR_PERIODS: [Period; 7] = [
        Period::OneM,
        Period::FiveM,
        Period::FifteenM,
        Period::OneH,
        Period::FourH,
        Period::OneD,
        Period::OneW,
    ];

    /// All metrics periods; the metrics base is 5m, not 1m.
    pub const METRICS_PERIODS: [Period; 6] = [
        Period::FiveM,
        Period::FifteenM,
        Period::OneH,
        Period::FourH,
        Period::OneD,
        Period::OneW,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::OneM => "1m",
            Period::FiveM => "5m",
            Period::FifteenM => "15m",
            Period::OneH => "1h",
            Period::FourH => "4h",
            Period::OneD => "1d",
            Period::OneW => "1w",
        }
    }

    pub fn parse(s: &str) -> Result<Period, EngineError> {
        match s {
            "1m" => Ok(Period::OneM),
            "5m" => Ok(Period::FiveM),
            "15m" => Ok(Period::FifteenM),
            "1h" => Ok(Period::OneH),
            "4h" => Ok(Period::FourH),
            "1d" => Ok(Period::OneD),
            "1w" => Ok(Period::OneW),
            other => Err(EngineError::InvalidPeriod(other.to_string())),
        }
    }

    /// Fixed duration of one bucket of this period.
    ///
    /// 1w buckets are exactly 7 days; this engine does not special-case
    /// DST or leap seconds since every timestamp is UTC.
    pub fn duration(self) -> Duration {
        match self {
            Period::OneM => Duration::minutes(1),
            Period::FiveM => Duration::minutes(5),
            Period::FifteenM => Duration::minutes(15),
            Period::OneH => Duration::hours(1),
            Period::FourH => Duration::hours(4),
            Period::OneD => Duration::days(1),
            Period::OneW => Duration::days(7),
        }
    }

    /// Floor `ts` down to the start of the bucket it falls in.
    ///
    /// Mirrors the original fusion engine's `floor_to_period`: minute-
    /// granularity periods truncate to the nearest lower multiple of their
    /// minute count, `1h`/`4h` truncate the hour the same way, `1d` floors
    /// to UTC midnight, and `1w` floors to the Monday 00:00 UTC at or
    /// before `ts`.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Period::OneM => ts
                .date_naive()
                .and_hms_opt(ts.hour(), ts.minute(), 0)
                .unwrap()
                .and_utc(),
            Period::FiveM => {
                let floored_minute = (ts.minute() / 5) * 5;
                ts.date_naive()
                    .and_hms_opt(ts.hour(), floored_minute, 0)
                    .unwrap()
                    .and_utc()
            }
            Period::FifteenM => {
                let floored_minute = (ts.minute() / 15) * 15;
                ts.date_naive()
                    .and_hms_opt(ts.hour(), floored_minute, 0)
                    .unwrap()
                    .and_utc()
            }
            Period::OneH => ts
                .date_naive()
                .and_hms_opt(ts.hour(), 0, 0)
                .unwrap()
                .and_utc(),
            Period::FourH => {
                let floored_hour = (ts.hour() / 4) * 4;
                ts.date_naive()
                    .and_hms_opt(floored_hour, 0, 0)
                    .unwrap()
                    .and_utc()
            }
            Period::OneD => ts.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            Period::OneW => week_start_for(ts),
        }
    }

    /// True once `now` has advanced past the end of the bucket starting
    /// at `bucket_ts`, i.e. the bucket can no longer receive updates.
    pub fn is_closed(self, bucket_ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= bucket_ts + self.duration()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monday 00:00 UTC at or before `ts`.
pub fn week_start_for(ts: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = ts.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
    let days_since_monday = midnight.weekday().num_days_from_monday();
    midnight - Duration::days(days_since_monday as i64)
}

/// Convenience used by warm-up and tests: construct a UTC timestamp from
/// calendar fields without reaching for `chrono::Utc::now()`.
pub fn ymd_hms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_one_minute() {
        let ts = ymd_hms(2026, 7, 27, 10, 23, 45);
        assert_eq!(Period::OneM.floor(ts), ymd_hms(2026, 7, 27, 10, 23, 0));
    }

    #[test]
    fn floors_five_minute() {
        let ts = ymd_hms(2026, 7, 27, 10, 23, 45);
        assert_eq!(Period::FiveM.floor(ts), ymd_hms(2026, 7, 27, 10, 20, 0));
    }

    #[test]
    fn floors_fifteen_minute() {
        let ts = ymd_hms(2026, 7, 27, 10, 44, 0);
        assert_eq!(Period::FifteenM.floor(ts), ymd_hms(2026, 7, 27, 10, 30, 0));
    }

    #[test]
    fn floors_four_hour() {
        let ts = ymd_hms(2026, 7, 27, 23, 10, 0);
        assert_eq!(Period::FourH.floor(ts), ymd_hms(2026, 7, 27, 20, 0, 0));
    }

    #[test]
    fn floors_day() {
        let ts = ymd_hms(2026, 7, 27, 23, 59, 59);
        assert_eq!(Period::OneD.floor(ts), ymd_hms(2026, 7, 27, 0, 0, 0));
    }

    #[test]
    fn floors_week_to_monday() {
        // 2026-07-27 is a Monday.
        let tuesday = ymd_hms(2026, 7, 28, 15, 0, 0);
        assert_eq!(Period::OneW.floor(tuesday), ymd_hms(2026, 7, 27, 0, 0, 0));

        let monday = ymd_hms(2026, 7, 27, 0, 0, 0);
        assert_eq!(Period::OneW.floor(monday), monday);
    }

    #[test]
    fn closed_once_duration_elapsed() {
        let bucket = ymd_hms(2026, 7, 27, 10, 0, 0);
        let still_open = ymd_hms(2026, 7, 27, 10, 4, 59);
        let just_closed = ymd_hms(2026, 7, 27, 10, 5, 0);
        assert!(!Period::FiveM.is_closed(bucket, still_open));
        assert!(Period::FiveM.is_closed(bucket, just_closed));
    }

    #[test]
    fn parses_and_rejects() {
        assert_eq!(Period::parse("1h").unwrap(), Period::OneH);
        assert!(Period::parse("3m").is_err());
    }
}
