//! Core data types for the EOL test station

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device families the station coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Motion,
    Mcu,
    LoadCell,
    PowerSupply,
    DigitalIo,
    PowerAnalyzer,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 6] = [
        DeviceKind::Motion,
        DeviceKind::Mcu,
        DeviceKind::LoadCell,
        DeviceKind::PowerSupply,
        DeviceKind::DigitalIo,
        DeviceKind::PowerAnalyzer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Motion => "motion",
            DeviceKind::Mcu => "mcu",
            DeviceKind::LoadCell => "load_cell",
            DeviceKind::PowerSupply => "power_supply",
            DeviceKind::DigitalIo => "digital_io",
            DeviceKind::PowerAnalyzer => "power_analyzer",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a device handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Faulted => "faulted",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical unit attached to every numeric reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Newton,
    KilogramForce,
    Volt,
    Ampere,
    Watt,
    Celsius,
    Millimeter,
    /// Digital level, 0.0 or 1.0
    Level,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Newton => "N",
            Unit::KilogramForce => "kgf",
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Watt => "W",
            Unit::Celsius => "°C",
            Unit::Millimeter => "mm",
            Unit::Level => "",
        }
    }
}

/// A decoded numeric value with its unit and decimal precision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub unit: Unit,
    /// Number of significant decimal places reported by the instrument
    pub precision: u8,
}

impl Reading {
    pub fn new(value: f64, unit: Unit, precision: u8) -> Self {
        Self {
            value,
            unit,
            precision,
        }
    }

    pub fn level(high: bool) -> Self {
        Self::new(if high { 1.0 } else { 0.0 }, Unit::Level, 0)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.*} {}",
            self.precision as usize,
            self.value,
            self.unit.symbol()
        )
    }
}

/// A reading attributed to its source device, immutable once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub source: DeviceKind,
    pub channel: Channel,
    pub value: f64,
    pub unit: Unit,
    pub precision: u8,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn record(source: DeviceKind, channel: Channel, reading: Reading) -> Self {
        Self {
            source,
            channel,
            value: reading.value,
            unit: reading.unit,
            precision: reading.precision,
            timestamp: Utc::now(),
        }
    }
}

/// What a `read_measurement` call samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Force,
    Voltage,
    Current,
    Power,
    Temperature,
    Position,
    Input(u16),
    Output(u16),
}

/// Settable device parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Voltage,
    Current,
    Velocity,
    Acceleration,
    UpperTemperature,
    OperatingTemperature,
    CoolingTemperature,
    FanSpeed,
    TestMode,
}

/// Device actions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Tare the load cell
    Zero,
    Hold,
    HoldRelease,
    OutputOn,
    OutputOff,
    ServoOn,
    ServoOff,
    Home,
    MoveTo {
        position: f64,
    },
    Stop,
    WriteOutput {
        channel: u16,
        level: bool,
    },
    /// MCU: start heating to the operating temperature and hold standby
    StandbyHeating {
        operating: f64,
        standby: f64,
        hold_ms: u32,
    },
    StandbyCooling,
    StrokeInitComplete,
    WaitBoot,
    IntegrationStart,
    IntegrationStop,
    IntegrationReset,
}

/// Test sequence phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Idle,
    Connecting,
    Preparing,
    Executing,
    Evaluating,
    Completed,
    Aborted,
    Faulted,
}

impl TestPhase {
    /// Position in the forward order; terminal failure phases share the top rank
    pub fn rank(&self) -> u8 {
        match self {
            TestPhase::Idle => 0,
            TestPhase::Connecting => 1,
            TestPhase::Preparing => 2,
            TestPhase::Executing => 3,
            TestPhase::Evaluating => 4,
            TestPhase::Completed | TestPhase::Aborted | TestPhase::Faulted => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestPhase::Completed | TestPhase::Aborted | TestPhase::Faulted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestPhase::Idle => "idle",
            TestPhase::Connecting => "connecting",
            TestPhase::Preparing => "preparing",
            TestPhase::Executing => "executing",
            TestPhase::Evaluating => "evaluating",
            TestPhase::Completed => "completed",
            TestPhase::Aborted => "aborted",
            TestPhase::Faulted => "faulted",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating a test's measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { reasons: Vec<String> },
    /// The test never reached evaluation
    Error,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_rank_order() {
        assert!(TestPhase::Idle.rank() < TestPhase::Connecting.rank());
        assert!(TestPhase::Preparing.rank() < TestPhase::Executing.rank());
        assert!(TestPhase::Evaluating.rank() < TestPhase::Completed.rank());
        assert!(TestPhase::Aborted.is_terminal());
        assert!(!TestPhase::Evaluating.is_terminal());
    }

    #[test]
    fn test_reading_display_uses_precision() {
        let r = Reading::new(2.5, Unit::Newton, 3);
        assert_eq!(r.to_string(), "2.500 N");
    }

    #[test]
    fn test_action_serde_tagged() {
        let json = serde_json::to_string(&Action::MoveTo { position: 12.5 }).unwrap();
        assert_eq!(json, r#"{"action":"move_to","position":12.5}"#);
        let back: Action = serde_json::from_str(r#"{"action":"output_off"}"#).unwrap();
        assert_eq!(back, Action::OutputOff);
    }

    #[test]
    fn test_device_kind_display() {
        assert_eq!(DeviceKind::PowerAnalyzer.to_string(), "power_analyzer");
    }
}
