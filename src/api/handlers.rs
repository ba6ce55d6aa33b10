//! API request handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

use crate::period::Period;

use super::responses::{BarsResponse, HealthResponse, MetricsResponse, SymbolsResponse};
use super::ApiState;

/// Query parameters shared by the candle and metrics endpoints: the
/// `exchange` an upstream caller believes it's talking to (checked
/// against configuration, since this engine only ever serves one), the
/// symbol and period to read, how many rows back, and whether the single
/// in-progress row should be included.
#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub exchange: Option<String>,
    pub symbol: String,
    pub interval: String,
    pub limit: Option<usize>,
    pub only_closed: Option<bool>,
}

/// Query parameters for the path-addressed `/bars/:symbol/:period` and
/// `/metrics/:symbol/:period` routes: everything `WindowQuery` carries
/// except `symbol`/`interval`, which come from the path instead.
#[derive(Debug, Deserialize)]
pub struct PathWindowQuery {
    pub exchange: Option<String>,
    pub limit: Option<usize>,
    pub only_closed: Option<bool>,
}

fn check_exchange(state: &ApiState, requested: &Option<String>) -> Result<(), StatusCode> {
    match requested {
        Some(exchange) if exchange != &state.engine.config().upstream.exchange_tag => Err(StatusCode::NOT_FOUND),
        _ => Ok(()),
    }
}

/// `GET /klines` -- the last `limit` bars for `(symbol, interval)`,
/// ascending.
pub async fn get_klines(
    State(state): State<ApiState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<BarsResponse>, StatusCode> {
    check_exchange(&state, &query.exchange)?;
    let period = Period::parse(&query.interval).map_err(|_| StatusCode::BAD_REQUEST)?;

    let default_limit = state.engine.config().fusion.cache_window;
    let limit = query.limit.unwrap_or(default_limit).min(default_limit).max(1);
    let only_closed = query.only_closed.unwrap_or(false);

    let bars = state
        .engine
        .get_bars_with_fallback(period, &query.symbol, limit, only_closed)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "upstream fallback read failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(BarsResponse {
        symbol: query.symbol,
        period: period.as_str().to_string(),
        count: bars.len(),
        bars,
    }))
}

/// `GET /metrics/futures` -- the last `limit` metrics snapshots for
/// `(symbol, interval)`, ascending. Named apart from `/metrics` so it
/// doesn't collide with the Prometheus scrape path on the monitoring port.
pub async fn get_futures_metrics(
    State(state): State<ApiState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<MetricsResponse>, StatusCode> {
    check_exchange(&state, &query.exchange)?;
    let period = Period::parse(&query.interval).map_err(|_| StatusCode::BAD_REQUEST)?;
    if period == state.engine.base_period() && period != state.engine.metrics_base_period() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let default_limit = state.engine.config().fusion.metrics_window;
    let limit = query.limit.unwrap_or(default_limit).min(default_limit).max(1);
    let only_closed = query.only_closed.unwrap_or(false);

    let metrics = state
        .engine
        .get_metrics_with_fallback(period, &query.symbol, limit, only_closed)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "upstream fallback read failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(MetricsResponse {
        symbol: query.symbol,
        period: period.as_str().to_string(),
        count: metrics.len(),
        metrics,
    }))
}

/// `GET /bars/:symbol/:period` -- path-addressed equivalent of `/klines`.
pub async fn get_bars_path(
    State(state): State<ApiState>,
    Path((symbol, period)): Path<(String, String)>,
    Query(query): Query<PathWindowQuery>,
) -> Result<Json<BarsResponse>, StatusCode> {
    get_klines(
        State(state),
        Query(WindowQuery {
            exchange: query.exchange,
            symbol,
            interval: period,
            limit: query.limit,
            only_closed: query.only_closed,
        }),
    )
    .await
}

/// `GET /metrics/:symbol/:period` -- path-addressed equivalent of
/// `/metrics/futures`.
pub async fn get_metrics_path(
    State(state): State<ApiState>,
    Path((symbol, period)): Path<(String, String)>,
    Query(query): Query<PathWindowQuery>,
) -> Result<Json<MetricsResponse>, StatusCode> {
    get_futures_metrics(
        State(state),
        Query(WindowQuery {
            exchange: query.exchange,
            symbol,
            interval: period,
            limit: query.limit,
            only_closed: query.only_closed,
        }),
    )
    .await
}

/// `GET /symbols` -- the symbol universe this engine is currently tracking.
pub async fn list_symbols(State(state): State<ApiState>) -> Json<SymbolsResponse> {
    let symbols = state.engine.symbols().await;
    Json(SymbolsResponse {
        exchange: state.engine.config().upstream.exchange_tag.clone(),
        count: symbols.len(),
        symbols,
    })
}

/// `GET /health` -- cheap liveness/freshness probe: whether the engine
/// has a symbol universe and how stale its high-water marks are.
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let symbols_tracked = state.engine.symbols().await.len();
    let status = if symbols_tracked > 0 { "healthy" } else { "starting" };
    Json(HealthResponse {
        status,
        base_period: state.engine.base_period().as_str().to_string(),
        metrics_base_period: state.engine.metrics_base_period().as_str().to_string(),
        symbols_tracked,
        last_seen: state.engine.last_seen().await.map(|ts| ts.timestamp()),
        last_metrics_seen: state.engine.last_metrics_seen().await.map(|ts| ts.timestamp()),
    })
}
