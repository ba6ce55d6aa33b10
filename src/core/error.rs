//! Centralized error types for the fusion engine

use thiserror::Error;

/// Top-level engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("upstream store error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("snapshot store error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("malformed notification payload: {0}")]
    MalformedNotification(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors talking to the upstream time-series store (Postgres)
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("listener disconnected: {0}")]
    ListenerDisconnected(String),

    #[error("bulk export failed: {0}")]
    BulkExport(String),
}

/// Errors talking to the snapshot/pub-sub store (Redis)
///
/// Callers at the engine boundary treat every variant as non-fatal: see
/// the best-effort handling described in the snapshot store module.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("cache error: {0}")]
    Cache(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("pool exhausted")]
    PoolExhausted,
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Upstream(UpstreamError::Database(err.to_string()))
    }
}

impl From<sqlx::Error> for UpstreamError {
    fn from(err: sqlx::Error) -> Self {
        UpstreamError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Snapshot(SnapshotError::Cache(err.to_string()))
    }
}

impl From<redis::RedisError> for SnapshotError {
    fn from(err: redis::RedisError) -> Self {
        SnapshotError::Cache(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SnapshotError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        SnapshotError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SnapshotError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        SnapshotError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Processing(err.to_string())
    }
}
