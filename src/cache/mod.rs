//! In-process bounded caches sitting in front of the snapshot store.

pub mod window;

pub use window::WindowCache;
