//! Stagehand Library
//!
//! Core modules for the stagehand deployment orchestrator.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod process;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;
