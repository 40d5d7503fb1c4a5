//! Configuration model for drover.
//!
//! This module defines the Config struct that represents `drover.yaml`.
//! It supports forward-compatible YAML parsing (unknown fields are ignored),
//! sensible defaults for optional fields, validation of config values, and
//! the allow-listed live updates the control plane applies.

mod model;
mod operations;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export public API
pub use model::Config;
pub use types::{
    AgentConfig, AgentLogLevel, AgentUpdate, CONFIG_FILE_NAME, SegmentSourceConfig, is_valid_label,
};
