//! Real-time multi-period OHLCV and futures-sentiment fusion engine.
//!
//! Reads closed 1m candles and 5m futures metrics as they land upstream,
//! rolls them up into the rest of the period hierarchy in memory, mirrors
//! the result to Redis for fast restarts and pub/sub fan-out, and serves
//! it back over a small HTTP API.

pub mod api;
pub mod cache;
pub mod catchup;
pub mod config;
pub mod core;
pub mod domain;
pub mod engine;
pub mod period;
pub mod store;

pub use config::EngineConfig;
pub use core::error::{EngineError, EngineResult};
pub use engine::FusionEngine;
pub use period::Period;
