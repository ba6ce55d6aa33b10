//! The fusion engine: wires the in-memory cache, the upstream reader, the
//! snapshot mirror, and the parallel catch-up engine together, and owns
//! the top-level warm-up -> catch-up -> steady-state sequencing.

pub mod eventloop;
pub mod state;
pub mod warmup;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::catchup::parallel::ParallelCatchupEngine;
use crate::config::EngineConfig;
use crate::core::error::EngineResult;
use crate::domain::bar::Bar;
use crate::domain::metrics::Metrics;
use crate::period::Period;
use crate::store::postgres::PostgresReader;
use crate::store::redis::SnapshotStore;

use self::eventloop::EventLoopContext;
use self::state::EngineCache;

/// Parsed, resolved form of [`EngineConfig`]'s period lists: this fails
/// fast at start-up if the config names a period string the engine
/// doesn't recognize, rather than on the first bar that hits it.
struct Periods {
    base: Period,
    derived: Vec<Period>,
    metrics_base: Period,
    metrics_derived: Vec<Period>,
}

impl Periods {
    fn resolve(config: &EngineConfig) -> EngineResult<Self> {
        let base = Period::parse(&config.fusion.base_period)?;
        let derived = config
            .fusion
            .periods
            .iter()
            .map(|s| Period::parse(s))
            .collect::<EngineResult<Vec<_>>>()?
            .into_iter()
            .filter(|p| *p != base)
            .collect();
        let metrics_base = Period::parse(&config.fusion.metrics_base_period)?;
        let metrics_derived = config
            .fusion
            .metrics_periods
            .iter()
            .map(|s| Period::parse(s))
            .collect::<EngineResult<Vec<_>>>()?
            .into_iter()
            .filter(|p| *p != metrics_base)
            .collect();
        Ok(Periods { base, derived, metrics_base, metrics_derived })
    }
}

/// Bounded so a burst of updates with no connected subscribers drops the
/// oldest rather than growing unbounded; `send` never blocks on lagging
/// receivers either way, matching `broadcast`'s usual semantics.
const WS_BROADCAST_CAPACITY: usize = 1024;

/// Top-level orchestrator. Cheap to clone: every field is an `Arc` (or
/// `Clone`-cheap config), so the API layer can hold its own handle
/// alongside the one driving the event loop.
#[derive(Clone)]
pub struct FusionEngine {
    cache: Arc<RwLock<EngineCache>>,
    reader: Arc<PostgresReader>,
    snapshot: Option<Arc<SnapshotStore>>,
    catchup: Arc<ParallelCatchupEngine>,
    config: Arc<EngineConfig>,
    symbols: Arc<RwLock<Vec<String>>>,
    base_period: Period,
    derived_periods: Arc<Vec<Period>>,
    metrics_base_period: Period,
    metrics_derived_periods: Arc<Vec<Period>>,
    broadcast_tx: broadcast::Sender<String>,
}

impl FusionEngine {
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        let periods = Periods::resolve(&config)?;

        let reader = Arc::new(
            PostgresReader::new(
                &config.upstream.upstream_url,
                config.upstream.max_connections,
                &config.upstream.exchange_tag,
            )
            .await?,
        );

        let snapshot = if config.snapshot.snapshot_url.is_empty() {
            None
        } else {
            match SnapshotStore::connect(&config.snapshot.snapshot_url, &config.snapshot.snapshot_key_prefix).await {
                Ok(store) => Some(Arc::new(store)),
                Err(err) => {
                    warn!(error = %err, "snapshot mirror unreachable at start-up, running without it");
                    None
                }
            }
        };

        let cache = EngineCache::new(
            config.fusion.cache_window,
            config.fusion.metrics_window,
            periods.base,
            periods.metrics_base,
        );

        let catchup = ParallelCatchupEngine::new(Arc::clone(&reader), config.parallel.clone());
        let (broadcast_tx, _) = broadcast::channel(WS_BROADCAST_CAPACITY);

        Ok(FusionEngine {
            cache: Arc::new(RwLock::new(cache)),
            reader,
            snapshot,
            catchup: Arc::new(catchup),
            config: Arc::new(config),
            symbols: Arc::new(RwLock::new(Vec::new())),
            base_period: periods.base,
            derived_periods: Arc::new(periods.derived),
            metrics_base_period: periods.metrics_base,
            metrics_derived_periods: Arc::new(periods.metrics_derived),
            broadcast_tx,
        })
    }

    /// Subscribe to the live bar/metrics update feed; used by the
    /// WebSocket relay to fan one internal broadcast out to many sockets.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve the symbol universe, try the snapshot fast path, fall back
    /// to a full historical load, then bring the cache current with
    /// whatever arrived upstream while warm-up was running.
    ///
    /// Both the restore and the full-load path build an entirely separate,
    /// unlocked [`EngineCache`] from upstream/Redis reads; the shared cache
    /// behind `self.cache`'s lock is only ever touched for the instant swap
    /// below, never across an `.await`.
    pub async fn warmup(&self) -> EngineResult<()> {
        let symbols = warmup::resolve_symbols(&self.reader, &self.config, self.base_period).await?;
        info!(count = symbols.len(), "resolved symbol universe");
        *self.symbols.write().await = symbols.clone();

        let restored = if let Some(snapshot) = &self.snapshot {
            warmup::try_restore_from_snapshot(
                snapshot,
                &symbols,
                self.base_period,
                self.metrics_base_period,
                &self.derived_periods,
                &self.metrics_derived_periods,
            )
            .await
        } else {
            None
        };

        let staging = match restored {
            Some(staged) => staged,
            None => {
                warmup::full_warmup(
                    &self.reader,
                    &symbols,
                    self.base_period,
                    self.metrics_base_period,
                    self.config.fusion.cache_window,
                    self.config.fusion.metrics_window,
                    &self.derived_periods,
                    &self.metrics_derived_periods,
                )
                .await?
            }
        };
        *self.cache.write().await = staging;

        self.catchup_to_now(&symbols).await?;

        if let Some(snapshot) = &self.snapshot {
            let cache = self.cache.read().await;
            warmup::full_sync_to_snapshot(
                &cache,
                snapshot,
                &self.derived_periods,
                &self.metrics_derived_periods,
                self.config.fusion.cache_window,
                self.config.fusion.metrics_window,
            )
            .await;
        }

        Ok(())
    }

    /// Replay anything the upstream store has recorded since the cache's
    /// high-water mark, using the partitioned parallel catch-up engine
    /// rather than a row-by-row replay.
    async fn catchup_to_now(&self, symbols: &[String]) -> EngineResult<()> {
        let last_seen = {
            let cache = self.cache.read().await;
            cache.last_seen()
        };
        let Some(last_seen) = last_seen else {
            return Ok(());
        };
        let now = Utc::now();
        let result = self
            .catchup
            .catchup_since_last_seen(self.base_period, &self.derived_periods, last_seen, symbols, now)
            .await?;

        if result.rows_read == 0 {
            return Ok(());
        }
        info!(rows = result.rows_read, "parallel catch-up applied");

        let mut cache = self.cache.write().await;
        for (period, by_symbol) in result.derived {
            for (symbol, bars) in by_symbol {
                for bar in bars {
                    if period == self.base_period {
                        cache.insert_historical_bar(period, bar);
                    } else {
                        insert_or_update_derived(&mut cache, period, &symbol, bar);
                    }
                }
            }
        }
        if let Some(new_last_seen) = result.new_last_seen {
            cache.set_last_seen(new_last_seen);
        }
        Ok(())
    }

    /// Run the steady-state update loop until the process is told to
    /// shut down. Dispatches to LISTEN/NOTIFY unless `poll_fallback` is
    /// configured.
    pub async fn run(&self) -> EngineResult<()> {
        let ctx = Arc::new(EventLoopContext {
            cache: Arc::clone(&self.cache),
            reader: Arc::clone(&self.reader),
            snapshot: self.snapshot.clone(),
            config: (*self.config).clone(),
            derived_periods: (*self.derived_periods).clone(),
            metrics_derived_periods: (*self.metrics_derived_periods).clone(),
            broadcast_tx: self.broadcast_tx.clone(),
        });

        self.spawn_full_sync_ticker();

        if self.config.fusion.poll_fallback {
            eventloop::run_poll(ctx).await
        } else {
            eventloop::run_listen(ctx).await
        }
    }

    fn spawn_full_sync_ticker(&self) {
        let Some(snapshot) = self.snapshot.clone() else { return };
        let cache = Arc::clone(&self.cache);
        let derived = Arc::clone(&self.derived_periods);
        let metrics_derived = Arc::clone(&self.metrics_derived_periods);
        let cache_window = self.config.fusion.cache_window;
        let metrics_window = self.config.fusion.metrics_window;
        let interval = self.config.snapshot.snapshot_sync_interval_secs.max(1);

        tokio::spawn(async move {
            loop {
                sleep(StdDuration::from_secs(interval)).await;
                let guard = cache.read().await;
                warmup::full_sync_to_snapshot(&guard, &snapshot, &derived, &metrics_derived, cache_window, metrics_window)
                    .await;
            }
        });
    }

    /// Handle used by the read API: the last `limit` bars for
    /// `(period, symbol)`, ascending.
    pub async fn get_bars(&self, period: Period, symbol: &str, limit: usize, only_closed: bool) -> Vec<Bar> {
        self.cache.read().await.get_bars(period, symbol, limit, only_closed)
    }

    pub async fn get_metrics(&self, period: Period, symbol: &str, limit: usize, only_closed: bool) -> Vec<Metrics> {
        self.cache.read().await.get_metrics(period, symbol, limit, only_closed)
    }

    /// Cache consumer contract: last `limit` bars, ascending, with
    /// an upstream read as a configurable fallback when the cache has
    /// nothing cached yet for this key.
    pub async fn get_bars_with_fallback(
        &self,
        period: Period,
        symbol: &str,
        limit: usize,
        only_closed: bool,
    ) -> EngineResult<Vec<Bar>> {
        let cached = self.get_bars(period, symbol, limit, only_closed).await;
        if !cached.is_empty() || !self.config.api.fallback_to_upstream {
            return Ok(cached);
        }
        let mut bars = self.reader.load_bar_window(period, symbol, limit as i64).await?;
        if only_closed {
            bars.retain(|b| b.is_closed);
        }
        Ok(bars)
    }

    pub async fn get_metrics_with_fallback(
        &self,
        period: Period,
        symbol: &str,
        limit: usize,
        only_closed: bool,
    ) -> EngineResult<Vec<Metrics>> {
        let cached = self.get_metrics(period, symbol, limit, only_closed).await;
        if !cached.is_empty() || !self.config.api.fallback_to_upstream {
            return Ok(cached);
        }
        let mut metrics = self.reader.load_metrics_window(period, symbol, limit as i64).await?;
        if only_closed {
            metrics.retain(|m| m.is_closed);
        }
        Ok(metrics)
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.symbols.read().await.clone()
    }

    pub async fn last_seen(&self) -> Option<chrono::DateTime<Utc>> {
        self.cache.read().await.last_seen()
    }

    pub async fn last_metrics_seen(&self) -> Option<chrono::DateTime<Utc>> {
        self.cache.read().await.last_metrics_seen()
    }

    pub fn base_period(&self) -> Period {
        self.base_period
    }

    pub fn metrics_base_period(&self) -> Period {
        self.metrics_base_period
    }

    pub fn bar_periods(&self) -> Vec<Period> {
        std::iter::once(self.base_period).chain(self.derived_periods.iter().copied()).collect()
    }

    pub fn metrics_periods(&self) -> Vec<Period> {
        std::iter::once(self.metrics_base_period)
            .chain(self.metrics_derived_periods.iter().copied())
            .collect()
    }
}

/// Catch-up's vectorized synthesis can produce either a closed bucket (no
/// corresponding unclosed state yet, append straight to the window) or an
/// update to the bucket the engine already has in progress -- merge those
/// into the existing unclosed state rather than overwrite it outright, so
/// a catch-up pass that only covers part of the current bucket doesn't
/// regress volume already accumulated from live events.
fn insert_or_update_derived(cache: &mut EngineCache, period: Period, symbol: &str, bar: Bar) {
    if bar.is_closed {
        cache.insert_historical_bar(period, bar);
        return;
    }
    match cache.unclosed_state(symbol, period) {
        Some(existing) if existing.period_start == bar.bucket_ts && existing.bar.bucket_ts <= bar.bucket_ts => {
            cache.restore_unclosed(
                symbol,
                period,
                crate::domain::bar::UnclosedState::new(symbol.to_string(), period, bar.bucket_ts, bar),
            );
        }
        None => {
            cache.restore_unclosed(
                symbol,
                period,
                crate::domain::bar::UnclosedState::new(symbol.to_string(), period, bar.bucket_ts, bar),
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods_resolve_filters_base_from_derived() {
        let config = EngineConfig::default();
        let periods = Periods::resolve(&config).unwrap();
        assert_eq!(periods.base, Period::OneM);
        assert!(!periods.derived.contains(&Period::OneM));
        assert_eq!(periods.derived.len(), 6);
        assert_eq!(periods.metrics_base, Period::FiveM);
        assert_eq!(periods.metrics_derived.len(), 5);
    }
}
