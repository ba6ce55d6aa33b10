//! Bulk catch-up when the engine has fallen behind the upstream store.

pub mod parallel;

pub use parallel::{CatchupResult, ParallelCatchupEngine};
