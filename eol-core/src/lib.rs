//! EOL Station Core Library
//!
//! Shared types, error taxonomy, sequence descriptions and configuration for
//! the end-of-line test station. Used by the hardware, engine and daemon
//! crates.

pub mod config;
pub mod error;
pub mod sequence;
pub mod types;

// Re-export commonly used types
pub use config::{
    default_config_path, DeviceConfig, DeviceOptions, DriverMode, EngineConfig, MockConfig,
    RetryConfig, StationConfig, TransportConfig,
};
pub use error::*;
pub use sequence::{Limit, PhaseSpec, Reduce, SequenceSpec, Step};
pub use types::*;
