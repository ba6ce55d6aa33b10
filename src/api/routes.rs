//! API route definitions.

use axum::routing::get;
use axum::Router;

use super::handlers::{get_bars_path, get_futures_metrics, get_klines, get_metrics_path, health, list_symbols};
use super::ws::websocket_handler;
use super::ApiState;

/// Cache-consumer routes: bars, metrics, symbol listing, health, and the
/// WebSocket relay. `/bars/:symbol/:period` and `/metrics/:symbol/:period`
/// are path-addressed equivalents of `/klines` and `/metrics/futures`.
pub fn create_kline_routes() -> Router<ApiState> {
    Router::new()
        .route("/klines", get(get_klines))
        .route("/metrics/futures", get(get_futures_metrics))
        .route("/bars/:symbol/:period", get(get_bars_path))
        .route("/metrics/:symbol/:period", get(get_metrics_path))
        .route("/symbols", get(list_symbols))
        .route("/health", get(health))
        .route("/ws", get(websocket_handler))
}
