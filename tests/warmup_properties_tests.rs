//! End-to-end coverage of the warm-up -> live transition on the pure/sync
//! half of the engine: reconstructing every derived period's in-progress
//! bucket from a tail of base-period history, then folding in a live bar
//! and checking the two halves agree on where the bucket picked up.

use chrono::Duration;
use kline_fusion_engine::domain::bar::Bar;
use kline_fusion_engine::engine::state::EngineCache;
use kline_fusion_engine::period::{ymd_hms, Period};

const DERIVED: [Period; 6] = [
    Period::FiveM,
    Period::FifteenM,
    Period::OneH,
    Period::FourH,
    Period::OneD,
    Period::OneW,
];

fn minute_bar(symbol: &str, ts: chrono::DateTime<chrono::Utc>, close: f64) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        period: Period::OneM,
        bucket_ts: ts,
        open: close,
        high: close + 0.5,
        low: close - 0.5,
        close,
        volume: 2.0,
        quote_volume: close * 2.0,
        trade_count: 2,
        taker_buy_volume: 1.0,
        taker_buy_quote_volume: close,
        is_closed: true,
    }
}

#[test]
fn synthesized_bucket_matches_one_built_by_live_processing_from_the_same_point() {
    let start = ymd_hms(2026, 7, 27, 10, 0, 0);
    // Three minutes already inside the current (not-yet-closed) 5m bucket.
    let history: Vec<Bar> = (0..3)
        .map(|m| minute_bar("BTCUSDT", start + Duration::minutes(m), 100.0 + m as f64))
        .collect();

    // Warm-up path: load history straight into the base window, then
    // synthesize every derived period's live bucket from the tail of it.
    let mut warmed = EngineCache::new(500, 240, Period::OneM, Period::FiveM);
    for bar in &history {
        warmed.insert_historical_bar(Period::OneM, bar.clone());
    }
    for &period in &DERIVED {
        warmed.synthesize_unclosed_for_period("BTCUSDT", period, &history);
    }

    // Live path: replay the same three bars one at a time through the
    // ordinary event path.
    let mut live = EngineCache::new(500, 240, Period::OneM, Period::FiveM);
    for bar in &history {
        live.process_base_bar(bar.clone(), &DERIVED);
    }

    for &period in &DERIVED {
        let warmed_state = warmed.unclosed_state("BTCUSDT", period).unwrap();
        let live_state = live.unclosed_state("BTCUSDT", period).unwrap();
        assert_eq!(warmed_state.period_start, live_state.period_start);
        assert_eq!(warmed_state.bar.open, live_state.bar.open);
        assert_eq!(warmed_state.bar.high, live_state.bar.high);
        assert_eq!(warmed_state.bar.low, live_state.bar.low);
        assert_eq!(warmed_state.bar.close, live_state.bar.close);
        assert_eq!(warmed_state.bar.volume, live_state.bar.volume);
    }
}

#[test]
fn a_live_bar_after_warmup_continues_the_synthesized_bucket_rather_than_restarting_it() {
    let start = ymd_hms(2026, 7, 27, 10, 0, 0);
    let history = vec![
        minute_bar("BTCUSDT", start, 100.0),
        minute_bar("BTCUSDT", start + Duration::minutes(1), 101.0),
    ];

    let mut cache = EngineCache::new(500, 240, Period::OneM, Period::FiveM);
    for bar in &history {
        cache.insert_historical_bar(Period::OneM, bar.clone());
    }
    cache.synthesize_unclosed_for_period("BTCUSDT", Period::FiveM, &history);
    // last_base_ts isn't populated by the historical-load path, so flush
    // needs a live bar first before it has a timestamp to stamp the bucket
    // with -- this mirrors how `full_warmup` always calls `flush_unclosed_to_cache`
    // only after loading, never before any live row has arrived.

    let next = minute_bar("BTCUSDT", start + Duration::minutes(2), 102.0);
    let outcome = cache.process_base_bar(next, &DERIVED).unwrap();
    assert!(outcome.closed.is_empty());

    let bucket = cache.unclosed_state("BTCUSDT", Period::FiveM).unwrap();
    assert_eq!(bucket.period_start, start);
    assert_eq!(bucket.bar.open, 100.0);
    assert_eq!(bucket.bar.close, 102.0);
    assert_eq!(bucket.bar.volume, 6.0);
}
