//! # observa-core
//!
//! Domain types and configuration for the Observa cluster inventory mirror.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AgentConfig, SinkConfig, SourceConfig};
pub use error::ConfigError;
