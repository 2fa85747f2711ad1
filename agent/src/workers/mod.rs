//! Long-running workers

pub mod watcher;
