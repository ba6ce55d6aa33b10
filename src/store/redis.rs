//! Snapshot mirror + pub/sub fan-out (Redis), and the compact msgpack
//! codec used for everything stored there.
//!
//! Every public method is best-effort: callers log and continue on error
//! rather than propagate, since the in-memory cache stays authoritative
//! even if the mirror is unreachable.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::{EngineResult, SnapshotError};
use crate::domain::bar::{Bar, UnclosedState};
use crate::domain::metrics::{Metrics, MetricsState};
use crate::period::Period;

fn ttl_secs(period: Period) -> usize {
    match period {
        Period::OneM => 86_400,
        Period::FiveM => 259_200,
        Period::FifteenM => 604_800,
        Period::OneH => 2_592_000,
        Period::FourH => 5_184_000,
        Period::OneD | Period::OneW => 31_536_000,
    }
}

/// Wire shape for a cached bar: field-shorthand keys, `ps` omitted for
/// base-period closed bars where `period_start == datetime`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireBar {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    qv: f64,
    tc: i64,
    tbv: f64,
    tbqv: f64,
    x: bool,
    ps: Option<i64>,
}

impl WireBar {
    fn from_bar(bar: &Bar, period_start: Option<DateTime<Utc>>) -> Self {
        WireBar {
            t: bar.bucket_ts.timestamp(),
            o: bar.open,
            h: bar.high,
            l: bar.low,
            c: bar.close,
            v: bar.volume,
            qv: bar.quote_volume,
            tc: bar.trade_count,
            tbv: bar.taker_buy_volume,
            tbqv: bar.taker_buy_quote_volume,
            x: bar.is_closed,
            ps: period_start.map(|ts| ts.timestamp()),
        }
    }

    fn into_bar(self, symbol: &str, period: Period) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            period,
            bucket_ts: Utc.timestamp_opt(self.t, 0).single().unwrap_or_else(Utc::now),
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
            quote_volume: self.qv,
            trade_count: self.tc,
            taker_buy_volume: self.tbv,
            taker_buy_quote_volume: self.tbqv,
            is_closed: self.x,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMetrics {
    t: i64,
    oi: f64,
    oiv: f64,
    ctlsr: f64,
    tlsr: f64,
    lsr: f64,
    tlsvr: f64,
    x: bool,
    ps: Option<i64>,
}

impl WireMetrics {
    fn from_metrics(m: &Metrics, period_start: Option<DateTime<Utc>>) -> Self {
        WireMetrics {
            t: m.bucket_ts.timestamp(),
            oi: m.open_interest,
            oiv: m.open_interest_value,
            ctlsr: m.count_toptrader_long_short_ratio,
            tlsr: m.toptrader_long_short_ratio,
            lsr: m.long_short_ratio,
            tlsvr: m.taker_long_short_vol_ratio,
            x: m.is_closed,
            ps: period_start.map(|ts| ts.timestamp()),
        }
    }

    fn into_metrics(self, symbol: &str, period: Period) -> Metrics {
        Metrics {
            symbol: symbol.to_string(),
            period,
            bucket_ts: Utc.timestamp_opt(self.t, 0).single().unwrap_or_else(Utc::now),
            open_interest: self.oi,
            open_interest_value: self.oiv,
            count_toptrader_long_short_ratio: self.ctlsr,
            toptrader_long_short_ratio: self.tlsr,
            long_short_ratio: self.lsr,
            taker_long_short_vol_ratio: self.tlsvr,
            is_closed: self.x,
        }
    }
}

#[derive(Debug, Serialize)]
struct BarPublishPayload<'a> {
    symbol: &'a str,
    period: &'a str,
    datetime: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
    trade_count: i64,
    taker_buy_volume: f64,
    taker_buy_quote_volume: f64,
    is_closed: bool,
    ts: i64,
}

#[derive(Debug, Serialize)]
struct MetricsPublishPayload<'a> {
    symbol: &'a str,
    period: &'a str,
    datetime: DateTime<Utc>,
    open_interest: f64,
    open_interest_value: f64,
    count_toptrader_long_short_ratio: f64,
    toptrader_long_short_ratio: f64,
    long_short_ratio: f64,
    taker_long_short_vol_ratio: f64,
    is_closed: bool,
    ts: i64,
}

pub struct SnapshotStore {
    pool: Pool,
    key_prefix: String,
}

impl SnapshotStore {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> EngineResult<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SnapshotError::Cache(e.to_string()))?;
        Ok(Self {
            pool,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn hc_key(&self, period: Period, symbol: &str) -> String {
        format!("{}:hc:{}:{}", self.key_prefix, period.as_str(), symbol)
    }

    fn unclosed_key(&self, period: Period, symbol: &str) -> String {
        format!("{}:unclosed:{}:{}", self.key_prefix, period.as_str(), symbol)
    }

    fn metrics_key(&self, period: Period, symbol: &str) -> String {
        format!("{}:metrics:{}:{}", self.key_prefix, period.as_str(), symbol)
    }

    fn meta_key(&self) -> String {
        format!("{}:meta", self.key_prefix)
    }

    /// Replace the whole bar hash with `bars`, keeping only the last
    /// `max_len` by key, and reset the TTL. Used once per warm-up flush
    /// and on full sync.
    pub async fn save_bars(&self, period: Period, symbol: &str, bars: &[Bar], max_len: usize) {
        if let Err(err) = self.try_save_bars(period, symbol, bars, max_len).await {
            warn!(%symbol, period = period.as_str(), error = %err, "save_bars failed, continuing in-memory");
        }
    }

    async fn try_save_bars(
        &self,
        period: Period,
        symbol: &str,
        bars: &[Bar],
        max_len: usize,
    ) -> EngineResult<()> {
        let mut conn = self.pool.get().await.map_err(|_| SnapshotError::PoolExhausted)?;
        let key = self.hc_key(period, symbol);
        let _: () = conn.del(&key).await.map_err(SnapshotError::from)?;

        let trimmed = &bars[bars.len().saturating_sub(max_len)..];
        if !trimmed.is_empty() {
            let mut pipe = redis::pipe();
            for bar in trimmed {
                let wire = WireBar::from_bar(bar, None);
                let encoded = rmp_serde::to_vec_named(&wire).map_err(SnapshotError::from)?;
                pipe.hset(&key, bar.bucket_ts.timestamp(), encoded);
            }
            pipe.query_async(&mut conn).await.map_err(SnapshotError::from)?;
        }
        let _: () = conn.expire(&key, ttl_secs(period) as i64).await.map_err(SnapshotError::from)?;
        Ok(())
    }

    /// Upsert individual bars into the hash without replacing it, the
    /// steady-state per-event path.
    pub async fn append_bars(&self, period: Period, symbol: &str, bars: &[Bar]) {
        if let Err(err) = self.try_append_bars(period, symbol, bars).await {
            warn!(%symbol, period = period.as_str(), error = %err, "append_bars failed, continuing in-memory");
        }
    }

    async fn try_append_bars(&self, period: Period, symbol: &str, bars: &[Bar]) -> EngineResult<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await.map_err(|_| SnapshotError::PoolExhausted)?;
        let key = self.hc_key(period, symbol);
        let mut pipe = redis::pipe();
        for bar in bars {
            let wire = WireBar::from_bar(bar, None);
            let encoded = rmp_serde::to_vec_named(&wire).map_err(SnapshotError::from)?;
            pipe.hset(&key, bar.bucket_ts.timestamp(), encoded);
        }
        pipe.query_async(&mut conn).await.map_err(SnapshotError::from)?;
        let _: () = conn.expire(&key, ttl_secs(period) as i64).await.map_err(SnapshotError::from)?;
        Ok(())
    }

    pub async fn save_unclosed(&self, period: Period, symbol: &str, state: &UnclosedState) {
        if let Err(err) = self.try_save_unclosed(period, symbol, state).await {
            warn!(%symbol, period = period.as_str(), error = %err, "save_unclosed failed, continuing in-memory");
        }
    }

    async fn try_save_unclosed(&self, period: Period, symbol: &str, state: &UnclosedState) -> EngineResult<()> {
        let mut conn = self.pool.get().await.map_err(|_| SnapshotError::PoolExhausted)?;
        let key = self.unclosed_key(period, symbol);
        let bar = &state.bar;
        let fields: Vec<(&str, String)> = vec![
            ("period_start", state.period_start.timestamp().to_string()),
            ("open", bar.open.to_string()),
            ("high", bar.high.to_string()),
            ("low", bar.low.to_string()),
            ("close", bar.close.to_string()),
            ("volume", bar.volume.to_string()),
            ("quote_volume", bar.quote_volume.to_string()),
            ("trade_count", bar.trade_count.to_string()),
            ("taker_buy_volume", bar.taker_buy_volume.to_string()),
            ("taker_buy_quote_volume", bar.taker_buy_quote_volume.to_string()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await.map_err(SnapshotError::from)?;
        let _: () = conn.expire(&key, ttl_secs(period) as i64).await.map_err(SnapshotError::from)?;
        Ok(())
    }

    pub async fn load_unclosed(&self, period: Period, symbol: &str) -> Option<UnclosedState> {
        match self.try_load_unclosed(period, symbol).await {
            Ok(state) => state,
            Err(err) => {
                warn!(%symbol, period = period.as_str(), error = %err, "load_unclosed failed");
                None
            }
        }
    }

    async fn try_load_unclosed(&self, period: Period, symbol: &str) -> EngineResult<Option<UnclosedState>> {
        let mut conn = self.pool.get().await.map_err(|_| SnapshotError::PoolExhausted)?;
        let key = self.unclosed_key(period, symbol);
        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(SnapshotError::from)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |name: &str| -> f64 { fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0.0) };
        let period_start = fields
            .get("period_start")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| SnapshotError::Cache("missing period_start".to_string()))?;

        let bar = Bar {
            symbol: symbol.to_string(),
            period,
            bucket_ts: period_start,
            open: get("open"),
            high: get("high"),
            low: get("low"),
            close: get("close"),
            volume: get("volume"),
            quote_volume: get("quote_volume"),
            trade_count: fields.get("trade_count").and_then(|v| v.parse().ok()).unwrap_or(0),
            taker_buy_volume: get("taker_buy_volume"),
            taker_buy_quote_volume: get("taker_buy_quote_volume"),
            is_closed: false,
        };
        Ok(Some(UnclosedState::new(symbol.to_string(), period, period_start, bar)))
    }

    /// Merge `metrics` into the existing hash then truncate to `max_len`
    /// entries by key, unlike `save_bars`'s pure replace.
    pub async fn save_metrics(&self, period: Period, symbol: &str, metrics: &[Metrics], max_len: usize) {
        if let Err(err) = self.try_save_metrics(period, symbol, metrics, max_len).await {
            warn!(%symbol, period = period.as_str(), error = %err, "save_metrics failed, continuing in-memory");
        }
    }

    async fn try_save_metrics(
        &self,
        period: Period,
        symbol: &str,
        metrics: &[Metrics],
        max_len: usize,
    ) -> EngineResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await.map_err(|_| SnapshotError::PoolExhausted)?;
        let key = self.metrics_key(period, symbol);

        let mut pipe = redis::pipe();
        for m in metrics {
            let wire = WireMetrics::from_metrics(m, None);
            let encoded = rmp_serde::to_vec_named(&wire).map_err(SnapshotError::from)?;
            pipe.hset(&key, m.bucket_ts.timestamp(), encoded);
        }
        pipe.query_async(&mut conn).await.map_err(SnapshotError::from)?;

        let existing_keys: Vec<i64> = conn.hkeys(&key).await.map_err(SnapshotError::from)?;
        if existing_keys.len() > max_len {
            let mut sorted = existing_keys;
            sorted.sort_unstable();
            let to_drop = &sorted[..sorted.len() - max_len];
            if !to_drop.is_empty() {
                let _: () = conn.hdel(&key, to_drop).await.map_err(SnapshotError::from)?;
            }
        }
        let _: () = conn.expire(&key, ttl_secs(period) as i64).await.map_err(SnapshotError::from)?;
        Ok(())
    }

    pub async fn set_last_seen(&self, last_seen: DateTime<Utc>) {
        let key = self.meta_key();
        match self.pool.get().await {
            Ok(mut conn) => {
                let _: Result<(), _> = conn.hset(&key, "last_seen", last_seen.timestamp()).await;
            }
            Err(err) => warn!(error = %err, "set_last_seen failed, continuing in-memory"),
        }
    }

    pub async fn load_last_seen(&self) -> Option<DateTime<Utc>> {
        let key = self.meta_key();
        let mut conn = self.pool.get().await.ok()?;
        let secs: Option<i64> = conn.hget(&key, "last_seen").await.ok()?;
        secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
    }

    /// Publish a single bar update on `kline:{symbol}:{period}` over a
    /// dedicated connection so a slow subscriber can't stall hash writes.
    pub async fn publish_bar_update(&self, period: Period, bar: &Bar) {
        let channel = format!("kline:{}:{}", bar.symbol, period.as_str());
        let payload = BarPublishPayload {
            symbol: &bar.symbol,
            period: period.as_str(),
            datetime: bar.bucket_ts,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            quote_volume: bar.quote_volume,
            trade_count: bar.trade_count,
            taker_buy_volume: bar.taker_buy_volume,
            taker_buy_quote_volume: bar.taker_buy_quote_volume,
            is_closed: bar.is_closed,
            ts: bar.bucket_ts.timestamp(),
        };
        self.publish_json(&channel, &payload).await;
    }

    pub async fn publish_batch(&self, period: Period, bars: &[Bar]) {
        for bar in bars {
            self.publish_bar_update(period, bar).await;
        }
    }

    pub async fn publish_metrics_update(&self, period: Period, metrics: &Metrics) {
        let channel = format!("metrics:{}:{}", metrics.symbol, period.as_str());
        let payload = MetricsPublishPayload {
            symbol: &metrics.symbol,
            period: period.as_str(),
            datetime: metrics.bucket_ts,
            open_interest: metrics.open_interest,
            open_interest_value: metrics.open_interest_value,
            count_toptrader_long_short_ratio: metrics.count_toptrader_long_short_ratio,
            toptrader_long_short_ratio: metrics.toptrader_long_short_ratio,
            long_short_ratio: metrics.long_short_ratio,
            taker_long_short_vol_ratio: metrics.taker_long_short_vol_ratio,
            is_closed: metrics.is_closed,
            ts: metrics.bucket_ts.timestamp(),
        };
        self.publish_json(&channel, &payload).await;
    }

    pub async fn publish_metrics_batch(&self, period: Period, metrics: &[Metrics]) {
        for m in metrics {
            self.publish_metrics_update(period, m).await;
        }
    }

    async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) {
        let Ok(mut conn) = self.pool.get().await else {
            warn!(channel, "publish failed: pool exhausted");
            return;
        };
        match serde_json::to_string(payload) {
            Ok(body) => {
                let _: Result<i64, _> = conn.publish(channel, body).await;
            }
            Err(err) => warn!(channel, error = %err, "failed to encode publish payload"),
        }
    }

    /// Load the closed-bar window for `(period, symbol)` back out of the
    /// snapshot store, used to gate warm-up against a full historical load.
    pub async fn restore_bars(&self, period: Period, symbol: &str) -> Vec<Bar> {
        match self.try_restore_bars(period, symbol).await {
            Ok(bars) => bars,
            Err(err) => {
                warn!(%symbol, period = period.as_str(), error = %err, "restore_bars failed");
                Vec::new()
            }
        }
    }

    async fn try_restore_bars(&self, period: Period, symbol: &str) -> EngineResult<Vec<Bar>> {
        let mut conn = self.pool.get().await.map_err(|_| SnapshotError::PoolExhausted)?;
        let key = self.hc_key(period, symbol);
        let raw: HashMap<i64, Vec<u8>> = conn.hgetall(&key).await.map_err(SnapshotError::from)?;
        let mut entries: Vec<(i64, Vec<u8>)> = raw.into_iter().collect();
        entries.sort_unstable_by_key(|(ts, _)| *ts);

        let mut bars = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            let wire: WireBar = rmp_serde::from_slice(&bytes).map_err(SnapshotError::from)?;
            bars.push(wire.into_bar(symbol, period));
        }
        Ok(bars)
    }

    pub async fn restore_metrics(&self, period: Period, symbol: &str) -> Vec<Metrics> {
        match self.try_restore_metrics(period, symbol).await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(%symbol, period = period.as_str(), error = %err, "restore_metrics failed");
                Vec::new()
            }
        }
    }

    async fn try_restore_metrics(&self, period: Period, symbol: &str) -> EngineResult<Vec<Metrics>> {
        let mut conn = self.pool.get().await.map_err(|_| SnapshotError::PoolExhausted)?;
        let key = self.metrics_key(period, symbol);
        let raw: HashMap<i64, Vec<u8>> = conn.hgetall(&key).await.map_err(SnapshotError::from)?;
        let mut entries: Vec<(i64, Vec<u8>)> = raw.into_iter().collect();
        entries.sort_unstable_by_key(|(ts, _)| *ts);

        let mut metrics = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            let wire: WireMetrics = rmp_serde::from_slice(&bytes).map_err(SnapshotError::from)?;
            metrics.push(wire.into_metrics(symbol, period));
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::ymd_hms;

    fn sample_bar() -> Bar {
        Bar {
            symbol: "BTCUSDT".to_string(),
            period: Period::OneM,
            bucket_ts: ymd_hms(2026, 7, 27, 10, 5, 0),
            open: 100.0,
            high: 101.0,
            low: 99.5,
            close: 100.5,
            volume: 10.0,
            quote_volume: 1000.0,
            trade_count: 42,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 500.0,
            is_closed: true,
        }
    }

    #[test]
    fn bar_codec_round_trips() {
        let bar = sample_bar();
        let wire = WireBar::from_bar(&bar, None);
        let encoded = rmp_serde::to_vec_named(&wire).unwrap();
        let decoded: WireBar = rmp_serde::from_slice(&encoded).unwrap();
        let round_tripped = decoded.into_bar(&bar.symbol, bar.period);
        assert_eq!(round_tripped, bar);
    }

    #[test]
    fn ttl_table_matches_contract() {
        assert_eq!(ttl_secs(Period::OneM), 86_400);
        assert_eq!(ttl_secs(Period::FiveM), 259_200);
        assert_eq!(ttl_secs(Period::FifteenM), 604_800);
        assert_eq!(ttl_secs(Period::OneH), 2_592_000);
        assert_eq!(ttl_secs(Period::FourH), 5_184_000);
        assert_eq!(ttl_secs(Period::OneD), 31_536_000);
        assert_eq!(ttl_secs(Period::OneW), 31_536_000);
    }
}
