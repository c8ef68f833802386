//! Station configuration loaded once at startup
//!
//! Located at `~/.config/eol/station.toml` by default.

use super::device::DeviceConfig;
use crate::sequence::SequenceSpec;
use crate::types::DeviceKind;
use crate::{EolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connect every configured device right after the engine starts
    pub connect_on_start: bool,
    /// Pause between repeated test cycles in milliseconds
    pub cycle_pause_ms: u64,
    /// Directory for archived test results, one JSON file per run.
    /// Results are not archived when unset.
    pub result_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_on_start: false,
            cycle_pause_ms: 1_000,
            result_dir: None,
        }
    }
}

/// Static configuration for the station daemon.
///
/// Immutable after load. Device entries are handed to driver constructors
/// and sequences to the engine catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub sequences: Vec<SequenceSpec>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl StationConfig {
    /// Parse StationConfig from TOML string.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize StationConfig to TOML string.
    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EolError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn device(&self, kind: DeviceKind) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.kind == kind)
    }

    pub fn sequence(&self, name: &str) -> Option<&SequenceSpec> {
        self.sequences.iter().find(|s| s.name == name)
    }

    /// Reject duplicate devices, real devices without transport, invalid
    /// sequences and sequences that use unconfigured devices.
    pub fn validate(&self) -> Result<()> {
        let mut kinds = HashSet::new();
        for device in &self.devices {
            if !kinds.insert(device.kind) {
                return Err(EolError::Config(format!(
                    "device '{}' configured more than once",
                    device.kind
                )));
            }
            if !device.is_mock() && device.transport.is_none() {
                return Err(EolError::Config(format!(
                    "device '{}' has no transport",
                    device.kind
                )));
            }
            device.retry.validate(device.kind)?;
        }

        let mut names = HashSet::new();
        for sequence in &self.sequences {
            sequence.validate()?;
            if !names.insert(sequence.name.as_str()) {
                return Err(EolError::Config(format!(
                    "sequence '{}' defined more than once",
                    sequence.name
                )));
            }
            if let Some(missing) = sequence
                .required_devices()
                .into_iter()
                .find(|kind| !kinds.contains(kind))
            {
                return Err(EolError::Config(format!(
                    "sequence '{}' requires unconfigured device '{}'",
                    sequence.name, missing
                )));
            }
        }
        Ok(())
    }
}
