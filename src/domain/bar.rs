//! Candle (OHLCV) domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::period::Period;

/// A closed OHLCV bar for one `(symbol, period, bucket_ts)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub period: Period,
    pub bucket_ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: i64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    /// True once `bucket_ts + period.duration() <= now` at the time this
    /// value was produced. Bars read back out of history are always closed;
    /// this flag only matters for the single current bar per key.
    pub is_closed: bool,
}

impl Bar {
    /// Start a new bar from the first base-period row seen in its bucket.
    pub fn open_from(symbol: &str, period: Period, bucket_ts: DateTime<Utc>, base: &Bar) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            period,
            bucket_ts,
            open: base.open,
            high: base.high,
            low: base.low,
            close: base.close,
            volume: base.volume,
            quote_volume: base.quote_volume,
            trade_count: base.trade_count,
            taker_buy_volume: base.taker_buy_volume,
            taker_buy_quote_volume: base.taker_buy_quote_volume,
            is_closed: false,
        }
    }

    /// Roll a later base-period row into this still-open bar: high/low take
    /// the extremes, close takes the latest value, everything volume-like
    /// accumulates.
    pub fn accumulate(&mut self, base: &Bar) {
        self.high = self.high.max(base.high);
        self.low = self.low.min(base.low);
        self.close = base.close;
        self.volume += base.volume;
        self.quote_volume += base.quote_volume;
        self.trade_count += base.trade_count;
        self.taker_buy_volume += base.taker_buy_volume;
        self.taker_buy_quote_volume += base.taker_buy_quote_volume;
    }
}

/// The single in-progress bar tracked per `(symbol, period)` while it
/// accumulates base-period rows, before it closes and is archived to
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnclosedState {
    pub symbol: String,
    pub period: Period,
    pub period_start: DateTime<Utc>,
    pub bar: Bar,
}

impl UnclosedState {
    pub fn new(symbol: String, period: Period, period_start: DateTime<Utc>, bar: Bar) -> Self {
        UnclosedState {
            symbol,
            period,
            period_start,
            bar,
        }
    }
}
