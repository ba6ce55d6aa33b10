//! Parallel catch-up: when the engine has fallen behind, partition the
//! gap into time-segment × symbol-batch tasks and fan them out across
//! isolated async workers instead of replaying row-by-row.
//!
//! Each worker owns nothing shared but its own pooled connection (the
//! in-process analogue of the original's `multiprocessing.Pool`); results
//! are merged and reduced back on the caller's task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::ParallelConfig;
use crate::core::error::EngineResult;
use crate::domain::bar::Bar;
use crate::period::Period;
use crate::store::PostgresReader;

/// Outcome of one catch-up pass: how many base rows were read, the new
/// high-water mark, and every period's freshly derived closed bars,
/// grouped by symbol.
pub struct CatchupResult {
    pub rows_read: usize,
    pub new_last_seen: Option<DateTime<Utc>>,
    pub derived: HashMap<Period, HashMap<String, Vec<Bar>>>,
}

pub struct ParallelCatchupEngine {
    reader: Arc<PostgresReader>,
    config: ParallelConfig,
}

impl ParallelCatchupEngine {
    pub fn new(reader: Arc<PostgresReader>, config: ParallelConfig) -> Self {
        Self { reader, config }
    }

    /// Partition `(last_seen, now]` into time segments and `symbols` into
    /// batches, run the cross-product of tasks on a bounded worker pool,
    /// merge the results, and vectorize them into every derived period.
    pub async fn catchup_since_last_seen(
        &self,
        base_period: Period,
        derived_periods: &[Period],
        last_seen: DateTime<Utc>,
        symbols: &[String],
        now: DateTime<Utc>,
    ) -> EngineResult<CatchupResult> {
        if symbols.is_empty() || last_seen >= now {
            return Ok(CatchupResult {
                rows_read: 0,
                new_last_seen: None,
                derived: HashMap::new(),
            });
        }

        let time_segments = build_time_segments(last_seen, now, self.config.time_segment_hours);
        let symbol_batches = build_symbol_batches(symbols, self.config.symbol_batch_size);
        info!(
            segments = time_segments.len(),
            batches = symbol_batches.len(),
            workers = self.config.workers,
            "starting parallel catch-up"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut handles = Vec::new();
        for (start, end) in &time_segments {
            for batch in &symbol_batches {
                let reader = Arc::clone(&self.reader);
                let semaphore = Arc::clone(&semaphore);
                let start = *start;
                let end = *end;
                let batch = batch.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    reader.load_base_range_for_symbols(base_period, start, end, &batch).await
                }));
            }
        }

        let mut merged = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(mut bars)) => merged.append(&mut bars),
                Ok(Err(err)) => warn!(error = %err, "catch-up worker failed, continuing with partial data"),
                Err(err) => warn!(error = %err, "catch-up worker task panicked"),
            }
        }

        if merged.is_empty() {
            warn!("parallel catch-up read no rows");
            return Ok(CatchupResult {
                rows_read: 0,
                new_last_seen: Some(last_seen),
                derived: HashMap::new(),
            });
        }

        merged.sort_by(|a, b| (a.bucket_ts, &a.symbol).cmp(&(b.bucket_ts, &b.symbol)));
        let new_last_seen = merged.iter().map(|b| b.bucket_ts).max();
        let rows_read = merged.len();

        let derived = vectorized_synthesis(&merged, derived_periods, now);

        Ok(CatchupResult {
            rows_read,
            new_last_seen,
            derived,
        })
    }
}

fn build_time_segments(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    segment_hours: i64,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let step = Duration::hours(segment_hours);
    let mut segments = Vec::new();
    let mut current = start;
    while current < end {
        let segment_end = (current + step).min(end);
        segments.push((current, segment_end));
        current = segment_end;
    }
    segments
}

fn build_symbol_batches(symbols: &[String], batch_size: usize) -> Vec<Vec<String>> {
    symbols.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

/// Roll merged base-period rows up into every derived period by grouping
/// `(symbol, period.floor(bucket_ts))` and accumulating like
/// `Bar::accumulate`, marking each resulting bucket closed iff the period
/// has actually elapsed by `now`.
fn vectorized_synthesis(
    base_rows: &[Bar],
    derived_periods: &[Period],
    now: DateTime<Utc>,
) -> HashMap<Period, HashMap<String, Vec<Bar>>> {
    let mut out: HashMap<Period, HashMap<String, Vec<Bar>>> = HashMap::new();

    for &period in derived_periods {
        let mut buckets: HashMap<(String, DateTime<Utc>), Bar> = HashMap::new();

        for row in base_rows {
            let bucket_ts = period.floor(row.bucket_ts);
            let key = (row.symbol.clone(), bucket_ts);
            match buckets.get_mut(&key) {
                Some(existing) => existing.accumulate(row),
                None => {
                    buckets.insert(key, Bar::open_from(&row.symbol, period, bucket_ts, row));
                }
            }
        }

        let mut by_symbol: HashMap<String, Vec<Bar>> = HashMap::new();
        for ((symbol, bucket_ts), mut bar) in buckets {
            bar.is_closed = period.is_closed(bucket_ts, now);
            by_symbol.entry(symbol).or_default().push(bar);
        }
        for bars in by_symbol.values_mut() {
            bars.sort_by_key(|b| b.bucket_ts);
        }

        out.insert(period, by_symbol);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::ymd_hms;

    fn bar(symbol: &str, ts: DateTime<Utc>, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            period: Period::OneM,
            bucket_ts: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            quote_volume: close,
            trade_count: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5,
            is_closed: true,
        }
    }

    #[test]
    fn time_segments_cover_the_whole_range_without_overlap() {
        let start = ymd_hms(2026, 7, 27, 0, 0, 0);
        let end = ymd_hms(2026, 7, 27, 13, 0, 0);
        let segments = build_time_segments(start, end, 6);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], (start, ymd_hms(2026, 7, 27, 6, 0, 0)));
        assert_eq!(segments[2].1, end);
    }

    #[test]
    fn symbol_batches_respect_batch_size() {
        let symbols: Vec<String> = (0..150).map(|i| format!("SYM{i}")).collect();
        let batches = build_symbol_batches(&symbols, 70);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 70);
        assert_eq!(batches[2].len(), 10);
    }

    #[test]
    fn vectorized_synthesis_accumulates_into_five_minute_buckets() {
        let rows = vec![
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 0, 0), 100.0),
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 1, 0), 101.0),
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 4, 0), 99.0),
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 5, 0), 102.0),
        ];
        let now = ymd_hms(2026, 7, 27, 10, 10, 0);
        let out = vectorized_synthesis(&rows, &[Period::FiveM], now);
        let by_symbol = out.get(&Period::FiveM).unwrap();
        let bars = by_symbol.get("BTCUSDT").unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].close, 99.0);
        assert!(bars[0].is_closed);
    }

    /// The vectorized catch-up path and the serial event-driven path
    /// (`EngineCache::process_base_bar`) must agree on every closed bucket
    /// they both produce, for the same stream of base rows replayed in order.
    #[test]
    fn vectorized_synthesis_matches_serial_cache_replay() {
        use crate::engine::state::EngineCache;

        let start = ymd_hms(2026, 7, 27, 9, 0, 0);
        let rows: Vec<Bar> = (0..180)
            .map(|minute| {
                let ts = start + Duration::minutes(minute);
                let close = 100.0 + ((minute * 13) % 29) as f64;
                bar_with_volume("BTCUSDT", ts, close, 1.0 + (minute % 5) as f64)
            })
            .collect();
        let now = start + Duration::minutes(180);

        let derived = [Period::FiveM, Period::FifteenM, Period::OneH];
        let vectorized = vectorized_synthesis(&rows, &derived, now);

        let mut cache = EngineCache::new(2000, 240, Period::OneM, Period::FiveM);
        for row in &rows {
            cache.process_base_bar(row.clone(), &derived);
        }

        for &period in &derived {
            let mut expected: Vec<Bar> = vectorized
                .get(&period)
                .and_then(|by_symbol| by_symbol.get("BTCUSDT"))
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|b| b.is_closed)
                .collect();
            expected.sort_by_key(|b| b.bucket_ts);

            let mut actual = cache.get_bars(period, "BTCUSDT", 1000, true);
            actual.sort_by_key(|b| b.bucket_ts);

            assert_eq!(
                actual.len(),
                expected.len(),
                "period {period}: closed-bucket count mismatch between serial and parallel paths"
            );
            for (a, e) in actual.iter().zip(expected.iter()) {
                assert_eq!(a.bucket_ts, e.bucket_ts, "period {period}: bucket_ts mismatch");
                assert_eq!(a.open, e.open, "period {period}: open mismatch at {}", a.bucket_ts);
                assert_eq!(a.high, e.high, "period {period}: high mismatch at {}", a.bucket_ts);
                assert_eq!(a.low, e.low, "period {period}: low mismatch at {}", a.bucket_ts);
                assert_eq!(a.close, e.close, "period {period}: close mismatch at {}", a.bucket_ts);
                assert_eq!(a.volume, e.volume, "period {period}: volume mismatch at {}", a.bucket_ts);
            }
        }
    }

    fn bar_with_volume(symbol: &str, ts: DateTime<Utc>, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            period: Period::OneM,
            bucket_ts: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume,
            quote_volume: close * volume,
            trade_count: 1,
            taker_buy_volume: volume * 0.4,
            taker_buy_quote_volume: volume * close * 0.4,
            is_closed: true,
        }
    }
}
