//! Steady-state update loops: LISTEN/NOTIFY by default, a plain polling
//! loop when `poll_fallback` is set or a connection keeps failing.
//!
//! A notification carries only enough to find the row it refers to
//! (`symbol`, `datetime`); `is_closed` is never taken from the wire. The
//! point-fetch that follows always reads a closed row back -- the base
//! tables this listens on only ever notify once a bucket has closed -- so
//! the authoritative flag comes from the row, not the notification.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::warn;

use crate::config::EngineConfig;
use crate::core::error::EngineResult;
use crate::domain::bar::Bar;
use crate::domain::metrics::Metrics;
use crate::engine::state::EngineCache;
use crate::period::Period;
use crate::store::listener;
use crate::store::postgres::PostgresReader;
use crate::store::redis::SnapshotStore;

const POLL_BATCH_ROWS: i64 = 5000;
const NOTIFY_CHANNEL_CAPACITY: usize = 1024;

pub struct EventLoopContext {
    pub cache: Arc<RwLock<EngineCache>>,
    pub reader: Arc<PostgresReader>,
    pub snapshot: Option<Arc<SnapshotStore>>,
    pub config: EngineConfig,
    pub derived_periods: Vec<Period>,
    pub metrics_derived_periods: Vec<Period>,
    pub broadcast_tx: broadcast::Sender<String>,
}

/// Wire shape forwarded to WebSocket subscribers, independent of whether
/// the Redis snapshot mirror is configured at all.
#[derive(Serialize)]
struct WsUpdate<'a, T> {
    kind: &'static str,
    #[serde(flatten)]
    payload: &'a T,
}

impl EventLoopContext {
    fn broadcast_bar(&self, bar: &Bar) {
        if self.broadcast_tx.receiver_count() == 0 {
            return;
        }
        match serde_json::to_string(&WsUpdate { kind: "bar", payload: bar }) {
            Ok(text) => {
                let _ = self.broadcast_tx.send(text);
            }
            Err(err) => warn!(error = %err, "failed to encode bar update for websocket relay"),
        }
    }

    fn broadcast_metrics(&self, metrics: &Metrics) {
        if self.broadcast_tx.receiver_count() == 0 {
            return;
        }
        match serde_json::to_string(&WsUpdate { kind: "metrics", payload: metrics }) {
            Ok(text) => {
                let _ = self.broadcast_tx.send(text);
            }
            Err(err) => warn!(error = %err, "failed to encode metrics update for websocket relay"),
        }
    }

    /// Fold one freshly-closed base bar into the cache and mirror the
    /// result: the bar itself, every period that closed as a side effect,
    /// and the refreshed unclosed snapshot for every derived period.
    async fn apply_bar(&self, bar: crate::domain::bar::Bar) {
        let symbol = bar.symbol.clone();
        let outcome = {
            let mut cache = self.cache.write().await;
            cache.process_base_bar(bar, &self.derived_periods)
        };
        let Some(outcome) = outcome else { return };
        if outcome.is_late {
            warn!(%symbol, ts = %outcome.base_bar.bucket_ts, "late base bar folded into base cache only");
        }

        let unclosed = {
            let mut cache = self.cache.write().await;
            cache.flush_unclosed_to_cache(&symbol, &self.derived_periods)
        };

        self.broadcast_bar(&outcome.base_bar);
        for closed in &outcome.closed {
            self.broadcast_bar(closed);
        }
        for live in &unclosed {
            self.broadcast_bar(live);
        }

        if let Some(snapshot) = &self.snapshot {
            snapshot
                .append_bars(self.base_period(), &symbol, std::slice::from_ref(&outcome.base_bar))
                .await;
            snapshot.publish_bar_update(self.base_period(), &outcome.base_bar).await;

            for closed in &outcome.closed {
                snapshot.append_bars(closed.period, &symbol, std::slice::from_ref(closed)).await;
                snapshot.publish_bar_update(closed.period, closed).await;
            }
            for live in &unclosed {
                let state = {
                    let cache = self.cache.read().await;
                    cache.unclosed_state(&symbol, live.period).cloned()
                };
                if let Some(state) = state {
                    snapshot.save_unclosed(live.period, &symbol, &state).await;
                }
                snapshot.publish_bar_update(live.period, live).await;
            }
        }
    }

    async fn apply_metrics(&self, metrics: crate::domain::metrics::Metrics) {
        let symbol = metrics.symbol.clone();
        let outcome = {
            let mut cache = self.cache.write().await;
            cache.process_base_metrics(metrics, &self.metrics_derived_periods)
        };
        let Some(outcome) = outcome else { return };
        if outcome.is_late {
            warn!(%symbol, ts = %outcome.base_metrics.bucket_ts, "late metrics row folded into base cache only");
        }

        let unclosed = {
            let mut cache = self.cache.write().await;
            cache.flush_metrics_unclosed_to_cache(&symbol, &self.metrics_derived_periods)
        };

        self.broadcast_metrics(&outcome.base_metrics);
        for closed in &outcome.closed {
            self.broadcast_metrics(closed);
        }
        for live in &unclosed {
            self.broadcast_metrics(live);
        }

        if let Some(snapshot) = &self.snapshot {
            snapshot
                .save_metrics(
                    self.metrics_base_period(),
                    &symbol,
                    std::slice::from_ref(&outcome.base_metrics),
                    self.config.fusion.metrics_window,
                )
                .await;
            snapshot.publish_metrics_update(self.metrics_base_period(), &outcome.base_metrics).await;

            for closed in &outcome.closed {
                snapshot
                    .save_metrics(closed.period, &symbol, std::slice::from_ref(closed), self.config.fusion.metrics_window)
                    .await;
                snapshot.publish_metrics_update(closed.period, closed).await;
            }
            for live in &unclosed {
                snapshot.publish_metrics_update(live.period, live).await;
            }
        }
    }

    fn base_period(&self) -> Period {
        Period::parse(&self.config.fusion.base_period).unwrap_or(Period::OneM)
    }

    fn metrics_base_period(&self) -> Period {
        Period::parse(&self.config.fusion.metrics_base_period).unwrap_or(Period::FiveM)
    }
}

/// LISTEN/NOTIFY mode: a dedicated task owns the connection and enqueues
/// parsed notifications onto a bounded channel (`listener::run_listener_task`);
/// this loop only ever dequeues, point-fetches the row the notification
/// refers to, and folds it in. The listener task never blocks on this
/// loop's processing, only on handing a message off.
pub async fn run_listen(ctx: Arc<EventLoopContext>) -> EngineResult<()> {
    let candles_channel = ctx.config.fusion.notify_channel_candles.clone();
    let metrics_channel = ctx.config.fusion.notify_channel_metrics.clone();
    let database_url = ctx.config.upstream.upstream_url.clone();

    let (tx, mut rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
    tokio::spawn(listener::run_listener_task(
        database_url,
        vec![candles_channel.clone(), metrics_channel.clone()],
        tx,
    ));

    while let Some((channel, event)) = rx.recv().await {
        if channel == candles_channel {
            match ctx.reader.fetch_bar_at(ctx.base_period(), &event.symbol, event.datetime).await {
                Ok(Some(bar)) => ctx.apply_bar(bar).await,
                Ok(None) => warn!(symbol = %event.symbol, ts = %event.datetime, "notified row not found"),
                Err(err) => warn!(error = %err, "point-fetch after notification failed"),
            }
        } else if channel == metrics_channel {
            match ctx
                .reader
                .fetch_metrics_at(ctx.metrics_base_period(), &event.symbol, event.datetime)
                .await
            {
                Ok(Some(metrics)) => ctx.apply_metrics(metrics).await,
                Ok(None) => warn!(symbol = %event.symbol, ts = %event.datetime, "notified metrics row not found"),
                Err(err) => warn!(error = %err, "metrics point-fetch after notification failed"),
            }
        }
    }

    warn!("notification listener task ended, falling out of listen mode");
    Ok(())
}

/// Polling mode: repeatedly ask the upstream store for everything newer
/// than the last row this engine has applied. Used when LISTEN/NOTIFY is
/// unavailable or `poll_fallback` is set.
pub async fn run_poll(ctx: Arc<EventLoopContext>) -> EngineResult<()> {
    let interval = StdDuration::from_secs_f64(ctx.config.fusion.poll_interval.max(0.01));

    loop {
        let last_seen = {
            let cache = ctx.cache.read().await;
            cache.last_seen()
        }
        .unwrap_or_else(Utc::now);
        let last_metrics_seen = {
            let cache = ctx.cache.read().await;
            cache.last_metrics_seen()
        }
        .unwrap_or_else(Utc::now);

        let bars = ctx.reader.load_base_since(ctx.base_period(), last_seen, POLL_BATCH_ROWS).await;
        let metrics = ctx
            .reader
            .load_metrics_since(ctx.metrics_base_period(), last_metrics_seen, POLL_BATCH_ROWS)
            .await;

        let mut did_work = false;
        match bars {
            Ok(rows) => {
                let truncated = rows.len() as i64 >= POLL_BATCH_ROWS;
                for bar in rows {
                    did_work = true;
                    ctx.apply_bar(bar).await;
                }
                if truncated {
                    warn!(limit = POLL_BATCH_ROWS, "poll batch hit the row cap, more rows remain");
                }
            }
            Err(err) => warn!(error = %err, "poll for new bars failed"),
        }

        match metrics {
            Ok(rows) => {
                for m in rows {
                    did_work = true;
                    ctx.apply_metrics(m).await;
                }
            }
            Err(err) => warn!(error = %err, "poll for new metrics failed"),
        }

        if !did_work {
            sleep(interval).await;
        }
    }
}
