//! Upstream time-series reader (Postgres/TimescaleDB).
//!
//! Runtime-checked queries (`sqlx::query` + manual `row.get`) rather than
//! `query_as!`/`query!`, since this engine never has a reachable
//! `DATABASE_URL` at build time.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::core::error::{EngineResult, UpstreamError};
use crate::domain::bar::Bar;
use crate::domain::metrics::Metrics;
use crate::period::Period;

#[derive(Clone)]
pub struct PostgresReader {
    pool: PgPool,
    exchange_tag: String,
}

impl PostgresReader {
    pub async fn new(database_url: &str, max_connections: u32, exchange_tag: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(UpstreamError::from)?;

        Ok(Self {
            pool,
            exchange_tag: exchange_tag.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn candles_table(period: Period) -> String {
        format!("candles_{}", period.as_str())
    }

    fn metrics_table(period: Period) -> String {
        if period == Period::FiveM {
            "binance_futures_metrics_5m".to_string()
        } else {
            format!("binance_futures_metrics_{}_last", period.as_str())
        }
    }

    /// The metrics base table keys rows by `create_time`; materialised
    /// higher-tier views key by `bucket` instead. Both are selected under
    /// the `datetime` alias so the row-mapping code stays uniform.
    fn metrics_time_column(period: Period) -> &'static str {
        if period == Period::FiveM {
            "create_time"
        } else {
            "bucket"
        }
    }

    /// Closed bars for `symbol` at `period`, most recent `limit` rows,
    /// returned oldest first.
    pub async fn load_bar_window(
        &self,
        period: Period,
        symbol: &str,
        limit: i64,
    ) -> EngineResult<Vec<Bar>> {
        let table = Self::candles_table(period);
        let query = format!(
            "SELECT symbol, bucket_ts, open, high, low, close, volume, quote_volume, \
             trade_count, taker_buy_volume, taker_buy_quote_volume \
             FROM {table} WHERE exchange = $1 AND symbol = $2 AND is_closed \
             ORDER BY bucket_ts DESC LIMIT $3"
        );

        let rows = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(symbol)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        let mut bars: Vec<Bar> = rows.iter().map(|row| row_to_bar(row, period)).collect();
        bars.reverse();
        Ok(bars)
    }

    /// Closed metrics for `symbol` at `period`, most recent `limit` rows,
    /// oldest first. Rows from higher-tier materialised views are always
    /// treated as closed.
    pub async fn load_metrics_window(
        &self,
        period: Period,
        symbol: &str,
        limit: i64,
    ) -> EngineResult<Vec<Metrics>> {
        let table = Self::metrics_table(period);
        let time_col = Self::metrics_time_column(period);
        let query = format!(
            "SELECT symbol, {time_col} AS datetime, sum_open_interest AS open_interest, \
             sum_open_interest_value AS open_interest_value, count_toptrader_long_short_ratio, \
             sum_toptrader_long_short_ratio AS toptrader_long_short_ratio, \
             sum_long_short_ratio AS long_short_ratio, \
             sum_taker_long_short_vol_ratio AS taker_long_short_vol_ratio \
             FROM {table} WHERE exchange = $1 AND symbol = $2 \
             ORDER BY {time_col} DESC LIMIT $3"
        );

        let rows = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(symbol)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        let mut metrics: Vec<Metrics> = rows.iter().map(|row| row_to_metrics(row, period)).collect();
        metrics.reverse();
        Ok(metrics)
    }

    /// Up to `limit` base-period rows newer than `since`, across all
    /// symbols, ordered by time then symbol. Used for catch-up and the
    /// poll-mode event loop, which caps each batch at 5,000 rows.
    pub async fn load_base_since(
        &self,
        base_period: Period,
        since: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<Bar>> {
        let table = Self::candles_table(base_period);
        let query = format!(
            "SELECT symbol, bucket_ts, open, high, low, close, volume, quote_volume, \
             trade_count, taker_buy_volume, taker_buy_quote_volume \
             FROM {table} WHERE exchange = $1 AND is_closed AND bucket_ts > $2 \
             ORDER BY bucket_ts ASC, symbol ASC LIMIT $3"
        );

        let rows = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        Ok(rows.iter().map(|row| row_to_bar(row, base_period)).collect())
    }

    /// Up to `limit` metrics-base-period rows newer than `since`, across all
    /// symbols. Symmetric to [`load_base_since`](Self::load_base_since),
    /// used by the poll-mode event loop when LISTEN/NOTIFY isn't available.
    pub async fn load_metrics_since(
        &self,
        metrics_base_period: Period,
        since: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<Metrics>> {
        let table = Self::metrics_table(metrics_base_period);
        let time_col = Self::metrics_time_column(metrics_base_period);
        let query = format!(
            "SELECT symbol, {time_col} AS datetime, sum_open_interest AS open_interest, \
             sum_open_interest_value AS open_interest_value, count_toptrader_long_short_ratio, \
             sum_toptrader_long_short_ratio AS toptrader_long_short_ratio, \
             sum_long_short_ratio AS long_short_ratio, \
             sum_taker_long_short_vol_ratio AS taker_long_short_vol_ratio \
             FROM {table} WHERE exchange = $1 AND is_closed AND {time_col} > $2 \
             ORDER BY {time_col} ASC, symbol ASC LIMIT $3"
        );

        let rows = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        Ok(rows.iter().map(|row| row_to_metrics(row, metrics_base_period)).collect())
    }

    /// One parallel catch-up worker's slice: closed base-period rows for a
    /// symbol batch within `(start, end]`, ordered `(bucket_ts, symbol)`.
    /// Mirrors the contract's binary-safe bulk export shape, implemented
    /// as a plain query rather than `COPY` so it stays on the shared
    /// connection pool instead of a raw protocol stream.
    pub async fn load_base_range_for_symbols(
        &self,
        base_period: Period,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        symbols: &[String],
    ) -> EngineResult<Vec<Bar>> {
        let table = Self::candles_table(base_period);
        let query = format!(
            "SELECT symbol, bucket_ts, open, high, low, close, volume, quote_volume, \
             trade_count, taker_buy_volume, taker_buy_quote_volume \
             FROM {table} WHERE exchange = $1 AND is_closed AND bucket_ts > $2 AND bucket_ts <= $3 \
             AND symbol = ANY($4) ORDER BY bucket_ts ASC, symbol ASC"
        );

        let rows = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(start)
            .bind(end)
            .bind(symbols)
            .fetch_all(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        Ok(rows.iter().map(|row| row_to_bar(row, base_period)).collect())
    }

    /// Single point-fetch by `(symbol, datetime)`, used after a LISTEN
    /// wake-up to read the row the notification referred to.
    pub async fn fetch_bar_at(
        &self,
        period: Period,
        symbol: &str,
        datetime: DateTime<Utc>,
    ) -> EngineResult<Option<Bar>> {
        let table = Self::candles_table(period);
        let query = format!(
            "SELECT symbol, bucket_ts, open, high, low, close, volume, quote_volume, \
             trade_count, taker_buy_volume, taker_buy_quote_volume \
             FROM {table} WHERE exchange = $1 AND symbol = $2 AND bucket_ts = $3 AND is_closed"
        );

        let row = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(symbol)
            .bind(datetime)
            .fetch_optional(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        Ok(row.map(|r| row_to_bar(&r, period)))
    }

    pub async fn fetch_metrics_at(
        &self,
        period: Period,
        symbol: &str,
        datetime: DateTime<Utc>,
    ) -> EngineResult<Option<Metrics>> {
        let table = Self::metrics_table(period);
        let time_col = Self::metrics_time_column(period);
        // Higher-tier metrics views carry no `is_closed` column; only the
        // base table needs the filter, and it's only ever point-fetched there.
        let closed_filter = if period == Period::FiveM { " AND is_closed" } else { "" };
        let query = format!(
            "SELECT symbol, {time_col} AS datetime, sum_open_interest AS open_interest, \
             sum_open_interest_value AS open_interest_value, count_toptrader_long_short_ratio, \
             sum_toptrader_long_short_ratio AS toptrader_long_short_ratio, \
             sum_long_short_ratio AS long_short_ratio, \
             sum_taker_long_short_vol_ratio AS taker_long_short_vol_ratio \
             FROM {table} WHERE exchange = $1 AND symbol = $2 AND {time_col} = $3{closed_filter}"
        );

        let row = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(symbol)
            .bind(datetime)
            .fetch_optional(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        Ok(row.map(|r| row_to_metrics(&r, period)))
    }

    /// Distinct symbols tracked for this exchange, used when
    /// `symbol_source = query`.
    pub async fn list_symbols(&self, base_period: Period) -> EngineResult<Vec<String>> {
        let table = Self::candles_table(base_period);
        let query = format!("SELECT DISTINCT symbol FROM {table} WHERE exchange = $1 ORDER BY symbol");

        let rows = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .fetch_all(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        Ok(rows.iter().map(|r| r.get::<String, _>("symbol")).collect())
    }

    /// Most recent closed `bucket_ts` for `(period, symbol)`, used to seed
    /// catch-up cursors.
    pub async fn latest_closed_timestamp(
        &self,
        period: Period,
        symbol: &str,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        let table = Self::candles_table(period);
        let query = format!(
            "SELECT MAX(bucket_ts) AS latest FROM {table} WHERE exchange = $1 AND symbol = $2 AND is_closed"
        );

        let row = sqlx::query(&query)
            .bind(&self.exchange_tag)
            .bind(symbol)
            .fetch_one(&self.pool)
            .await
            .map_err(UpstreamError::from)?;

        Ok(row.try_get::<Option<DateTime<Utc>>, _>("latest").unwrap_or(None))
    }
}

fn row_to_bar(row: &sqlx::postgres::PgRow, period: Period) -> Bar {
    let datetime: DateTime<Utc> = row.get("bucket_ts");
    Bar {
        symbol: row.get("symbol"),
        period,
        bucket_ts: datetime,
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
        quote_volume: row.get("quote_volume"),
        trade_count: row.get("trade_count"),
        taker_buy_volume: row.get("taker_buy_volume"),
        taker_buy_quote_volume: row.get("taker_buy_quote_volume"),
        is_closed: true,
    }
}

fn row_to_metrics(row: &sqlx::postgres::PgRow, period: Period) -> Metrics {
    let datetime: DateTime<Utc> = row.get("datetime");
    Metrics {
        symbol: row.get("symbol"),
        period,
        bucket_ts: datetime,
        open_interest: row.get("open_interest"),
        open_interest_value: row.get("open_interest_value"),
        count_toptrader_long_short_ratio: row.get("count_toptrader_long_short_ratio"),
        toptrader_long_short_ratio: row.get("toptrader_long_short_ratio"),
        long_short_ratio: row.get("long_short_ratio"),
        taker_long_short_vol_ratio: row.get("taker_long_short_vol_ratio"),
        is_closed: true,
    }
}
