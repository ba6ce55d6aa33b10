//! In-memory bounded history windows for bars and metrics.
//!
//! Keyed `period -> symbol -> bucket_ts -> value`, deduplicated the same
//! way the fusion engine this was grounded on does it: closed values are
//! keyed by their bucket timestamp, the single unclosed value per
//! `(period, symbol)` is keyed by its `period_start` and replaces any
//! prior unclosed entry for that same start before insertion.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::bar::Bar;
use crate::domain::metrics::Metrics;
use crate::period::Period;

/// A value that can be stored in a `WindowCache`.
pub trait Windowed {
    fn bucket_ts(&self) -> DateTime<Utc>;
    fn is_closed(&self) -> bool;
}

impl Windowed for Bar {
    fn bucket_ts(&self) -> DateTime<Utc> {
        self.bucket_ts
    }
    fn is_closed(&self) -> bool {
        self.is_closed
    }
}

impl Windowed for Metrics {
    fn bucket_ts(&self) -> DateTime<Utc> {
        self.bucket_ts
    }
    fn is_closed(&self) -> bool {
        self.is_closed
    }
}

/// Bounded, deduplicated history for one value type across all periods
/// and symbols.
///
/// `limit` bounds every period except the base period when
/// `unbounded_base` is set, mirroring `window_1m=None` ("no truncation")
/// in the source this was modeled on.
pub struct WindowCache<T: Windowed> {
    limit: usize,
    base_period: Period,
    unbounded_base: bool,
    store: HashMap<Period, HashMap<String, BTreeMap<DateTime<Utc>, T>>>,
}

impl<T: Windowed> WindowCache<T> {
    pub fn new(limit: usize, base_period: Period, unbounded_base: bool) -> Self {
        WindowCache {
            limit,
            base_period,
            unbounded_base,
            store: HashMap::new(),
        }
    }

    /// Insert or replace a value, trimming the oldest entry if the window
    /// for this `(period, symbol)` now exceeds its limit.
    pub fn append(&mut self, period: Period, symbol: &str, value: T) {
        let symbol_store = self
            .store
            .entry(period)
            .or_default()
            .entry(symbol.to_string())
            .or_default();

        if !value.is_closed() {
            symbol_store.retain(|_, v| v.is_closed());
        }
        symbol_store.insert(value.bucket_ts(), value);

        let unbounded = period == self.base_period && self.unbounded_base;
        if !unbounded && symbol_store.len() > self.limit {
            if let Some(&oldest) = symbol_store.keys().next() {
                symbol_store.remove(&oldest);
            }
        }
    }

    /// All values for `(period, symbol)`, oldest first.
    pub fn get(&self, period: Period, symbol: &str) -> Vec<&T> {
        self.store
            .get(&period)
            .and_then(|by_symbol| by_symbol.get(symbol))
            .map(|ts_map| ts_map.values().collect())
            .unwrap_or_default()
    }

    /// The most recent value for `(period, symbol)`, if any.
    pub fn latest(&self, period: Period, symbol: &str) -> Option<&T> {
        self.store
            .get(&period)
            .and_then(|by_symbol| by_symbol.get(symbol))
            .and_then(|ts_map| ts_map.values().next_back())
    }

    /// Whether a value already sits at exactly `bucket_ts` for `(period, symbol)`.
    /// Used to detect duplicate base-period rows before they're applied twice.
    pub fn contains(&self, period: Period, symbol: &str, bucket_ts: DateTime<Utc>) -> bool {
        self.store
            .get(&period)
            .and_then(|by_symbol| by_symbol.get(symbol))
            .map(|ts_map| ts_map.contains_key(&bucket_ts))
            .unwrap_or(false)
    }

    pub fn symbols(&self, period: Period) -> Vec<String> {
        self.store
            .get(&period)
            .map(|by_symbol| by_symbol.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, period: Period) -> usize {
        self.store
            .get(&period)
            .map(|by_symbol| by_symbol.values().map(|m| m.len()).sum())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::ymd_hms;

    fn sample_metrics(symbol: &str, period: Period, ts: DateTime<Utc>, closed: bool) -> Metrics {
        Metrics {
            symbol: symbol.to_string(),
            period,
            bucket_ts: ts,
            open_interest: 1.0,
            open_interest_value: 2.0,
            count_toptrader_long_short_ratio: 1.0,
            toptrader_long_short_ratio: 1.0,
            long_short_ratio: 1.0,
            taker_long_short_vol_ratio: 1.0,
            is_closed: closed,
        }
    }

    #[test]
    fn trims_oldest_when_over_limit() {
        let mut cache: WindowCache<Metrics> = WindowCache::new(2, Period::FiveM, false);
        for minute in [0, 5, 10] {
            let ts = ymd_hms(2026, 7, 27, 0, minute, 0);
            cache.append(Period::FiveM, "BTCUSDT", sample_metrics("BTCUSDT", Period::FiveM, ts, true));
        }
        let got = cache.get(Period::FiveM, "BTCUSDT");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].bucket_ts, ymd_hms(2026, 7, 27, 0, 5, 0));
    }

    #[test]
    fn unclosed_entry_replaces_prior_unclosed() {
        let mut cache: WindowCache<Metrics> = WindowCache::new(10, Period::FiveM, false);
        let start = ymd_hms(2026, 7, 27, 0, 0, 0);
        cache.append(
            Period::OneH,
            "BTCUSDT",
            sample_metrics("BTCUSDT", Period::OneH, start, false),
        );
        let mid = ymd_hms(2026, 7, 27, 0, 30, 0);
        cache.append(
            Period::OneH,
            "BTCUSDT",
            sample_metrics("BTCUSDT", Period::OneH, mid, false),
        );
        let got = cache.get(Period::OneH, "BTCUSDT");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].bucket_ts, mid);
    }

    #[test]
    fn base_period_unbounded_when_configured() {
        let mut cache: WindowCache<Metrics> = WindowCache::new(1, Period::FiveM, true);
        for minute in [0, 5, 10, 15] {
            let ts = ymd_hms(2026, 7, 27, 0, minute, 0);
            cache.append(Period::FiveM, "BTCUSDT", sample_metrics("BTCUSDT", Period::FiveM, ts, true));
        }
        assert_eq!(cache.get(Period::FiveM, "BTCUSDT").len(), 4);
    }
}
