//! Deployment engine

pub mod apps;
pub mod ddocs;
pub mod ledger;
pub mod pipeline;
pub mod stager;
pub mod warmer;
