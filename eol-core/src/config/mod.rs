//! Configuration types
//!
//! - `station`: the whole station file (engine, devices, sequences)
//! - `device`: per-device transport, retry, options and mock settings
//! - `paths`: default file locations

mod device;
mod paths;
mod station;

pub use device::{
    DeviceConfig, DeviceOptions, DriverMode, MockConfig, RetryConfig, TransportConfig,
};
pub use paths::{default_config_path, CONFIG_ENV_VAR};
pub use station::{EngineConfig, StationConfig};
