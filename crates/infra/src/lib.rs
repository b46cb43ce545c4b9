//! Infrastructure layer: job persistence, scheduling, workers, config.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, Settings, StoreBackend};
