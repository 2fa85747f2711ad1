//! Data models

pub mod ddoc;
pub mod deployment;
pub mod package;
