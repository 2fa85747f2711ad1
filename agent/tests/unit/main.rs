//! Integration tests driving the library through the in-memory store

mod helpers;
mod test_apps;
mod test_install;
mod test_progress;
mod test_staging;
mod test_watcher;
