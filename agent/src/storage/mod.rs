//! On-disk state: settings and deployment directories

pub mod layout;
pub mod settings;
