//! Storage backends: the upstream time-series reader and the snapshot
//! mirror, plus the notification listener that wakes the engine up.

pub mod listener;
pub mod postgres;
pub mod redis;

pub use listener::{run_listener_task, NotifyEvent, NotifyMessage};
pub use postgres::PostgresReader;
pub use redis::SnapshotStore;
