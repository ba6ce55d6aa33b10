//! JSON response shapes for the cache consumer API.

use serde::Serialize;

use crate::domain::bar::Bar;
use crate::domain::metrics::Metrics;

#[derive(Debug, Serialize)]
pub struct BarsResponse {
    pub symbol: String,
    pub period: String,
    pub count: usize,
    pub bars: Vec<Bar>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub symbol: String,
    pub period: String,
    pub count: usize,
    pub metrics: Vec<Metrics>,
}

#[derive(Debug, Serialize)]
pub struct SymbolsResponse {
    pub exchange: String,
    pub count: usize,
    pub symbols: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub base_period: String,
    pub metrics_base_period: String,
    pub symbols_tracked: usize,
    pub last_seen: Option<i64>,
    pub last_metrics_seen: Option<i64>,
}
