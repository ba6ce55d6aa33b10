//! Start-up sequencing: try the snapshot mirror first, fall back to a full
//! historical load from the upstream store, then push whatever the engine
//! now believes back out to the mirror so the next restart's fast path has
//! something fresh to read.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::core::error::EngineResult;
use crate::domain::bar::Bar;
use crate::domain::metrics::Metrics;
use crate::engine::state::EngineCache;
use crate::period::{week_start_for, Period};
use crate::store::postgres::PostgresReader;
use crate::store::redis::SnapshotStore;

/// Resolve the symbol universe per `fusion.symbol_source`: a static list
/// from config, or a live query against the upstream store's candle table.
pub async fn resolve_symbols(
    reader: &PostgresReader,
    config: &EngineConfig,
    base_period: Period,
) -> EngineResult<Vec<String>> {
    if config.fusion.symbol_source == "static" {
        return Ok(config.fusion.symbols.clone());
    }
    reader.list_symbols(base_period).await
}

/// Attempt to restore the whole cache from the snapshot mirror. Builds an
/// entirely fresh, unlocked [`EngineCache`] and returns it; the caller swaps
/// it into the shared cache with a single, non-awaiting write-lock
/// acquisition. Returns `None` if any symbol's restored 1m history covers
/// less than the minutes elapsed since the start of the current UTC week --
/// anything short of that can't back a correct 1w/1d/4h bucket, and the
/// caller should fall through to a full historical warm-up instead.
pub async fn try_restore_from_snapshot(
    snapshot: &SnapshotStore,
    symbols: &[String],
    base_period: Period,
    metrics_base_period: Period,
    derived_periods: &[Period],
    metrics_derived_periods: &[Period],
) -> Option<EngineCache> {
    let now = Utc::now();
    let minutes_since_week_start = (now - week_start_for(now)).num_minutes().max(0) as usize;

    let mut staging = EngineCache::new(usize::MAX, usize::MAX, base_period, metrics_base_period);

    for symbol in symbols {
        let base_bars = snapshot.restore_bars(base_period, symbol).await;
        if base_bars.len() < minutes_since_week_start {
            warn!(
                %symbol,
                restored = base_bars.len(),
                required = minutes_since_week_start,
                "snapshot restore coverage insufficient, falling back to full warm-up"
            );
            return None;
        }

        for bar in base_bars {
            staging.insert_historical_bar(base_period, bar);
        }
        for &period in derived_periods {
            for bar in snapshot.restore_bars(period, symbol).await {
                staging.insert_historical_bar(period, bar);
            }
            if let Some(state) = snapshot.load_unclosed(period, symbol).await {
                staging.restore_unclosed(symbol, period, state);
            }
        }

        for metrics in snapshot.restore_metrics(metrics_base_period, symbol).await {
            staging.insert_historical_metrics(metrics_base_period, metrics);
        }
        for &period in metrics_derived_periods {
            for metrics in snapshot.restore_metrics(period, symbol).await {
                staging.insert_historical_metrics(period, metrics);
            }
        }
    }

    if let Some(last_seen) = snapshot.load_last_seen().await {
        staging.set_last_seen(last_seen);
        staging.set_last_metrics_seen(last_seen);
    }

    info!(symbols = symbols.len(), "restored engine state from snapshot mirror");
    Some(staging)
}

/// Historical warm-up depth, in rows, per period -- independent of
/// `cache_window`/`metrics_window` (which bound the steady-state in-memory
/// window once the engine is live). Ground truth for these numbers is the
/// distilled original's warm-up lookback table: seven days of base-period
/// history, thirty days of daily bars, twelve weeks of weekly bars.
fn bar_lookback_rows(period: Period) -> i64 {
    match period {
        Period::OneM => 10_080,
        Period::FiveM => 2_016,
        Period::FifteenM => 672,
        Period::OneH => 168,
        Period::FourH => 42,
        Period::OneD => 30,
        Period::OneW => 12,
    }
}

/// Metrics lookback mirrors the bar table for the periods metrics actually
/// has (metrics has no 1m tier).
fn metrics_lookback_rows(period: Period) -> i64 {
    bar_lookback_rows(period)
}

/// Load one bar period's full lookback window across every symbol on its
/// own task, so one period's queries never wait behind another's. Bounded
/// by construction: one task per period, never more, each working through
/// its own pooled connection.
async fn load_bar_histories(
    reader: &Arc<PostgresReader>,
    periods: &[Period],
    symbols: &[String],
) -> HashMap<Period, HashMap<String, Vec<Bar>>> {
    let mut handles = Vec::with_capacity(periods.len());
    for &period in periods {
        let reader = Arc::clone(reader);
        let symbols = symbols.to_vec();
        handles.push((
            period,
            tokio::spawn(async move {
                let mut by_symbol = HashMap::with_capacity(symbols.len());
                for symbol in &symbols {
                    match reader.load_bar_window(period, symbol, bar_lookback_rows(period)).await {
                        Ok(bars) => {
                            by_symbol.insert(symbol.clone(), bars);
                        }
                        Err(err) => warn!(%symbol, %period, error = %err, "warm-up bar load failed"),
                    }
                }
                by_symbol
            }),
        ));
    }

    let mut result = HashMap::with_capacity(handles.len());
    for (period, handle) in handles {
        match handle.await {
            Ok(by_symbol) => {
                result.insert(period, by_symbol);
            }
            Err(err) => warn!(%period, error = %err, "warm-up bar-load task panicked"),
        }
    }
    result
}

/// Metrics equivalent of [`load_bar_histories`].
async fn load_metrics_histories(
    reader: &Arc<PostgresReader>,
    periods: &[Period],
    symbols: &[String],
) -> HashMap<Period, HashMap<String, Vec<Metrics>>> {
    let mut handles = Vec::with_capacity(periods.len());
    for &period in periods {
        let reader = Arc::clone(reader);
        let symbols = symbols.to_vec();
        handles.push((
            period,
            tokio::spawn(async move {
                let mut by_symbol = HashMap::with_capacity(symbols.len());
                for symbol in &symbols {
                    match reader.load_metrics_window(period, symbol, metrics_lookback_rows(period)).await {
                        Ok(metrics) => {
                            by_symbol.insert(symbol.clone(), metrics);
                        }
                        Err(err) => warn!(%symbol, %period, error = %err, "warm-up metrics load failed"),
                    }
                }
                by_symbol
            }),
        ));
    }

    let mut result = HashMap::with_capacity(handles.len());
    for (period, handle) in handles {
        match handle.await {
            Ok(by_symbol) => {
                result.insert(period, by_symbol);
            }
            Err(err) => warn!(%period, error = %err, "warm-up metrics-load task panicked"),
        }
    }
    result
}

/// Full warm-up: load every period's closed history straight from its own
/// upstream table -- one task per period, fanned out across a bounded pool
/// (at most `derived_periods.len() + 1` bar tasks, and the metrics
/// equivalent) rather than one query after another -- then rebuild just the
/// live in-progress bucket per derived period from the tail of the
/// base-period window already loaded. This is the path the original always
/// exercised, since derived periods other than the base keep their own
/// materialized closed-history tables and never need that history
/// reconstructed by roll-up.
///
/// Builds and returns an entirely fresh, unlocked [`EngineCache`]; nothing
/// here touches the shared cache behind its lock, so the whole fan-out runs
/// with no exclusive access held. The caller swaps the result in with a
/// single, non-awaiting write-lock acquisition.
pub async fn full_warmup(
    reader: &Arc<PostgresReader>,
    symbols: &[String],
    base_period: Period,
    metrics_base_period: Period,
    cache_window: usize,
    metrics_window: usize,
    derived_periods: &[Period],
    metrics_derived_periods: &[Period],
) -> EngineResult<EngineCache> {
    let mut cache = EngineCache::new(cache_window, metrics_window, base_period, metrics_base_period);

    let mut bar_periods = Vec::with_capacity(derived_periods.len() + 1);
    bar_periods.push(base_period);
    bar_periods.extend_from_slice(derived_periods);

    let mut metrics_periods = Vec::with_capacity(metrics_derived_periods.len() + 1);
    metrics_periods.push(metrics_base_period);
    metrics_periods.extend_from_slice(metrics_derived_periods);

    let (mut bar_histories, mut metrics_histories) = tokio::join!(
        load_bar_histories(reader, &bar_periods, symbols),
        load_metrics_histories(reader, &metrics_periods, symbols),
    );

    for symbol in symbols {
        let base_bars = bar_histories
            .get_mut(&base_period)
            .and_then(|by_symbol| by_symbol.remove(symbol))
            .unwrap_or_default();
        for bar in &base_bars {
            cache.insert_historical_bar(base_period, bar.clone());
        }

        for &period in derived_periods {
            if let Some(history) = bar_histories.get_mut(&period).and_then(|by_symbol| by_symbol.remove(symbol)) {
                for bar in history {
                    cache.insert_historical_bar(period, bar);
                }
            }
            cache.synthesize_unclosed_for_period(symbol, period, &base_bars);
        }
        cache.flush_unclosed_to_cache(symbol, derived_periods);

        let base_metrics = metrics_histories
            .get_mut(&metrics_base_period)
            .and_then(|by_symbol| by_symbol.remove(symbol))
            .unwrap_or_default();
        for metrics in &base_metrics {
            cache.insert_historical_metrics(metrics_base_period, metrics.clone());
        }

        for &period in metrics_derived_periods {
            if let Some(history) = metrics_histories.get_mut(&period).and_then(|by_symbol| by_symbol.remove(symbol)) {
                for metrics in history {
                    cache.insert_historical_metrics(period, metrics);
                }
            }
            cache.synthesize_metrics_unclosed_for_period(symbol, period, &base_metrics);
        }
        cache.flush_metrics_unclosed_to_cache(symbol, metrics_derived_periods);
    }

    info!(symbols = symbols.len(), "full warm-up complete");
    Ok(cache)
}

/// Push the whole in-memory cache to the snapshot mirror: every period's
/// window, every symbol's unclosed state, and the high-water marks. Run
/// once after warm-up and on the periodic full-sync tick.
pub async fn full_sync_to_snapshot(
    cache: &EngineCache,
    snapshot: &SnapshotStore,
    bar_periods: &[Period],
    metrics_periods: &[Period],
    cache_window: usize,
    metrics_window: usize,
) {
    for &period in bar_periods {
        for symbol in cache.bar_symbols(period) {
            let bars = cache.get_bars(period, &symbol, cache_window, true);
            snapshot.save_bars(period, &symbol, &bars, cache_window).await;
            if let Some(state) = cache.unclosed_state(&symbol, period) {
                snapshot.save_unclosed(period, &symbol, state).await;
            }
        }
    }
    for &period in metrics_periods {
        for symbol in cache.bar_symbols(period) {
            let metrics = cache.get_metrics(period, &symbol, metrics_window, true);
            snapshot.save_metrics(period, &symbol, &metrics, metrics_window).await;
        }
    }
    if let Some(last_seen) = cache.last_seen() {
        snapshot.set_last_seen(last_seen).await;
    }
    info!("full sync to snapshot mirror complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bar::Bar;
    use crate::period::ymd_hms;

    fn bar(symbol: &str, ts: chrono::DateTime<Utc>, close: f64) -> Bar {
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
    fn bar_lookback_covers_a_full_week_of_base_history() {
        // 1w's in-progress bucket can span up to 7 days of 1m bars; the
        // lookback has to reach back that far or warm-up would reconstruct
        // a truncated live week.
        assert_eq!(bar_lookback_rows(Period::OneM), 7 * 24 * 60);
        assert_eq!(bar_lookback_rows(Period::OneW), 12);
        assert_eq!(metrics_lookback_rows(Period::FiveM), bar_lookback_rows(Period::FiveM));
    }

    #[test]
    fn synthesize_unclosed_folds_only_the_live_bucket() {
        let mut cache = EngineCache::new(500, 240, Period::OneM, Period::FiveM);
        let base = vec![
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 0, 0), 100.0),
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 3, 0), 103.0),
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 5, 0), 105.0),
            bar("BTCUSDT", ymd_hms(2026, 7, 27, 10, 6, 0), 106.0),
        ];
        cache.synthesize_unclosed_for_period("BTCUSDT", Period::FiveM, &base);
        let state = cache.unclosed_state("BTCUSDT", Period::FiveM).unwrap();
        assert_eq!(state.period_start, ymd_hms(2026, 7, 27, 10, 5, 0));
        assert_eq!(state.bar.open, 105.0);
        assert_eq!(state.bar.close, 106.0);
        assert_eq!(state.bar.volume, 2.0);
    }
}
