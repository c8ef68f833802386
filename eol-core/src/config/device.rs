//! Per-device configuration
//!
//! Consumed once when a driver is constructed. Drivers copy what they need
//! and never look at the configuration again.

use crate::types::{DeviceKind, Unit};
use crate::{EolError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Whether the device is driven for real or simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    #[default]
    Real,
    Mock,
}

/// Transport family and its connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    Tcp {
        host: String,
        #[serde(default = "default_scpi_port")]
        port: u16,
    },
    Native {
        library: PathBuf,
        #[serde(default = "default_irq")]
        irq: i32,
    },
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_scpi_port() -> u16 {
    5025
}

fn default_irq() -> i32 {
    7
}

impl TransportConfig {
    pub fn describe(&self) -> String {
        match self {
            TransportConfig::Serial { port, baud_rate } => format!("{}@{}", port, baud_rate),
            TransportConfig::Tcp { host, port } => format!("{}:{}", host, port),
            TransportConfig::Native { library, irq } => {
                format!("{} (irq {})", library.display(), irq)
            }
        }
    }
}

/// Connect backoff and command retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Connect attempts before giving up
    pub connect_attempts: u32,
    /// First delay between connect attempts in milliseconds
    pub connect_initial_delay_ms: u64,
    /// Upper bound for the connect delay in milliseconds
    pub connect_max_delay_ms: u64,
    /// Delay multiplier between connect attempts
    pub backoff_multiplier: f64,
    /// Deadline for one command/response exchange in milliseconds
    pub command_timeout_ms: u64,
    /// Retries of a command after a transient failure
    pub command_retries: u32,
    /// Fixed delay between command retries in milliseconds
    pub command_retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_initial_delay_ms: 500,
            connect_max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            command_timeout_ms: 3_000,
            command_retries: 2,
            command_retry_delay_ms: 200,
        }
    }
}

impl RetryConfig {
    /// Reject a backoff multiplier for `device` that is not a finite
    /// number of at least 1
    pub fn validate(&self, device: DeviceKind) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(EolError::Config(format!(
                "device '{}': backoff_multiplier must be a finite number >= 1, got {}",
                device, self.backoff_multiplier
            )));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn command_retry_delay(&self) -> Duration {
        Duration::from_millis(self.command_retry_delay_ms)
    }
}

/// Device-specific options with workable defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Load cell indicator id (0-9)
    pub indicator_id: u8,
    /// Minimum spacing between serial commands in milliseconds
    pub min_command_interval_ms: u64,
    /// Settling delay after a tare in milliseconds
    pub zero_settle_ms: u64,
    /// Motion axis number
    pub axis: i32,
    /// Default motion velocity (mm/s)
    pub velocity: f64,
    /// Default motion acceleration (mm/s²)
    pub acceleration: f64,
    /// Polling interval while waiting for motion or homing in milliseconds
    pub motion_poll_ms: u64,
    /// Upper bound for a move or homing cycle in milliseconds
    pub motion_timeout_ms: u64,
    /// Power analyzer input element (1-6)
    pub element: u8,
    /// DIO outputs driven low by cleanup and emergency stop
    pub safe_outputs: Vec<u16>,
    /// Delay after a power supply setting change in milliseconds
    pub stabilization_ms: u64,
    /// Upper bound for MCU boot and temperature-reached notifications
    /// in milliseconds
    pub status_timeout_ms: u64,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            indicator_id: 1,
            min_command_interval_ms: 200,
            zero_settle_ms: 0,
            axis: 0,
            velocity: 50.0,
            acceleration: 200.0,
            motion_poll_ms: 20,
            motion_timeout_ms: 30_000,
            element: 1,
            safe_outputs: Vec::new(),
            stabilization_ms: 0,
            status_timeout_ms: 40_000,
        }
    }
}

/// Simulation parameters for mock drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Base value returned by reads (force, voltage, temperature...)
    pub base: f64,
    /// Secondary base value (current for power devices)
    pub base_secondary: f64,
    /// Symmetric noise bound added to every read
    pub noise: f64,
    /// Unit reported by reads; family default when absent
    pub unit: Option<Unit>,
    /// Seed for reproducible noise
    pub seed: Option<u64>,
    /// Simulated connect latency in milliseconds
    pub connect_delay_ms: u64,
    /// Simulated latency for every other command in milliseconds
    pub command_delay_ms: u64,
    /// Make every connect attempt fail
    pub fail_connect: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            base: 0.0,
            base_secondary: 0.0,
            noise: 0.0,
            unit: None,
            seed: None,
            connect_delay_ms: 0,
            command_delay_ms: 0,
            fail_connect: false,
        }
    }
}

/// Everything needed to construct one device driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    #[serde(default)]
    pub mode: DriverMode,
    /// Required in real mode
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub options: DeviceOptions,
    #[serde(default)]
    pub mock: MockConfig,
}

impl DeviceConfig {
    /// Mock device with default options
    pub fn mock(kind: DeviceKind) -> Self {
        Self {
            kind,
            mode: DriverMode::Mock,
            transport: None,
            retry: RetryConfig::default(),
            options: DeviceOptions::default(),
            mock: MockConfig::default(),
        }
    }

    /// Real device on the given transport with default options
    pub fn real(kind: DeviceKind, transport: TransportConfig) -> Self {
        Self {
            kind,
            mode: DriverMode::Real,
            transport: Some(transport),
            retry: RetryConfig::default(),
            options: DeviceOptions::default(),
            mock: MockConfig::default(),
        }
    }

    pub fn with_mock(mut self, mock: MockConfig) -> Self {
        self.mock = mock;
        self
    }

    pub fn is_mock(&self) -> bool {
        self.mode == DriverMode::Mock
    }
}
