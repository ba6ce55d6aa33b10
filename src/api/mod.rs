//! Read-only HTTP API in front of the fusion engine's cache, plus a
//! separate Prometheus/health endpoint on the monitoring port.

pub mod handlers;
pub mod responses;
pub mod routes;
pub mod ws;

pub use routes::*;

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;
use crate::engine::FusionEngine;

/// Shared API state: a cheap handle to the engine (everything inside it
/// is already `Arc`-backed).
#[derive(Clone)]
pub struct ApiState {
    pub engine: FusionEngine,
}

impl ApiState {
    pub fn new(engine: FusionEngine) -> Self {
        Self { engine }
    }
}

/// Start the cache-consumer API on `config.bind_address`.
pub async fn start_server(engine: FusionEngine, config: &ApiConfig) -> Result<tokio::task::JoinHandle<()>> {
    let app = create_app(engine, config);

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!("API server listening on {}", config.bind_address);

    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "API server error");
        }
    });

    Ok(handle)
}

/// Start the Prometheus/liveness server on `port`, separate from the
/// cache-consumer API so scraping never competes with it for connections.
pub async fn start_metrics_server(port: u16) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(prometheus_handler))
        .route("/health", get(plain_health_handler));

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("metrics server listening on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "metrics server error");
        }
    });

    Ok(handle)
}

fn create_app(engine: FusionEngine, config: &ApiConfig) -> Router {
    let state = ApiState::new(engine);
    let app = Router::new().merge(create_kline_routes()).with_state(state);

    if config.enable_cors {
        app.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
    } else {
        app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }
}

async fn prometheus_handler() -> Result<String, StatusCode> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn plain_health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
        "service": "kline-fusion-engine",
    }))
}

