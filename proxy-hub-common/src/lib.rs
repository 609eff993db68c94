//! Shared infrastructure: configuration loading and the logger bootstrap.

pub mod config;
pub mod logger;

pub use config::{CloudConfig, HubConfig};
pub use logger::Logger;
