//! Futures-sentiment metrics domain types.
//!
//! Unlike bars, metrics roll up by last-writer-wins snapshot, never by
//! summation: a 1h metrics bucket holds whatever the most recent 5m
//! metrics row said, not an aggregate of the hour's rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;

/// A futures-sentiment snapshot for one `(symbol, period, bucket_ts)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub symbol: String,
    pub period: Period,
    pub bucket_ts: DateTime<Utc>,
    pub open_interest: f64,
    pub open_interest_value: f64,
    pub count_toptrader_long_short_ratio: f64,
    pub toptrader_long_short_ratio: f64,
    pub long_short_ratio: f64,
    pub taker_long_short_vol_ratio: f64,
    pub is_closed: bool,
}

impl Metrics {
    /// Roll a later 5m metrics row into the current higher-period bucket:
    /// the whole row is replaced, since metrics never accumulate.
    pub fn replace_with(&mut self, latest: &Metrics) {
        self.open_interest = latest.open_interest;
        self.open_interest_value = latest.open_interest_value;
        self.count_toptrader_long_short_ratio = latest.count_toptrader_long_short_ratio;
        self.toptrader_long_short_ratio = latest.toptrader_long_short_ratio;
        self.long_short_ratio = latest.long_short_ratio;
        self.taker_long_short_vol_ratio = latest.taker_long_short_vol_ratio;
    }
}

/// The single in-progress metrics snapshot tracked per `(symbol, period)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsState {
    pub symbol: String,
    pub period: Period,
    pub period_start: DateTime<Utc>,
    pub metrics: Metrics,
}

impl MetricsState {
    pub fn new(symbol: String, period: Period, period_start: DateTime<Utc>, metrics: Metrics) -> Self {
        MetricsState {
            symbol,
            period,
            period_start,
            metrics,
        }
    }
}
