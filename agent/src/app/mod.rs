//! Application wiring

pub mod bootstrap;
pub mod options;
pub mod run;
