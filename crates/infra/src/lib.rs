//! Infrastructure layer: job storage, the queue components and their config.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, QueueConfig};
