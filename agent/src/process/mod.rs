//! External processes

pub mod lifecycle;
