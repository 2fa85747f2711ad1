//! Filesystem helpers

pub mod dir;
pub mod file;
pub mod link;
pub mod lockfile;
