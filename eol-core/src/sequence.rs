//! Declarative test sequence descriptions
//!
//! A sequence is a list of phases. Connecting and Evaluating are implicit:
//! the runner connects the union of every phase's required devices first,
//! and evaluates after the last declared phase.

use crate::types::{Action, Channel, DeviceKind, Parameter, TestPhase, Unit};
use crate::{EolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How repeated samples collapse into recorded measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduce {
    /// Record every sample
    #[default]
    Each,
    /// Record the sample with the largest magnitude
    Peak,
    /// Record the arithmetic mean
    Mean,
}

/// One step inside a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Set {
        device: DeviceKind,
        parameter: Parameter,
        value: f64,
    },
    Actuate {
        device: DeviceKind,
        #[serde(flatten)]
        action: Action,
    },
    Sample {
        device: DeviceKind,
        channel: Channel,
        #[serde(default = "default_count")]
        count: u32,
        #[serde(default)]
        interval_ms: u64,
        #[serde(default)]
        reduce: Reduce,
    },
    /// Device settling delay
    Settle { ms: u64 },
    /// Poll a digital input until it reaches `level`; the phase timeout bounds the wait
    WaitInput {
        device: DeviceKind,
        input: u16,
        level: bool,
        #[serde(default = "default_poll_ms")]
        poll_ms: u64,
    },
}

fn default_count() -> u32 {
    1
}

fn default_poll_ms() -> u64 {
    50
}

impl Step {
    pub fn device(&self) -> Option<DeviceKind> {
        match self {
            Step::Set { device, .. }
            | Step::Actuate { device, .. }
            | Step::Sample { device, .. }
            | Step::WaitInput { device, .. } => Some(*device),
            Step::Settle { .. } => None,
        }
    }
}

/// A declared phase with its required devices and timeout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub phase: TestPhase,
    #[serde(default)]
    pub required: Vec<DeviceKind>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Acceptance window for measurements from one device in one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub device: DeviceKind,
    pub unit: Unit,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Named test sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub name: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_evaluate_timeout_ms")]
    pub evaluate_timeout_ms: u64,
    pub phases: Vec<PhaseSpec>,
    #[serde(default)]
    pub limits: Vec<Limit>,
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_evaluate_timeout_ms() -> u64 {
    5_000
}

impl SequenceSpec {
    /// Union of required devices across all phases, in stable order
    pub fn required_devices(&self) -> Vec<DeviceKind> {
        let mut set = BTreeSet::new();
        for phase in &self.phases {
            set.extend(phase.required.iter().copied());
            set.extend(phase.steps.iter().filter_map(Step::device));
        }
        set.into_iter().collect()
    }

    /// Check that phases are declared in forward order and only use
    /// Preparing/Executing.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EolError::Config("sequence name is empty".to_string()));
        }
        let mut last = TestPhase::Connecting;
        for phase in &self.phases {
            if !matches!(phase.phase, TestPhase::Preparing | TestPhase::Executing) {
                return Err(EolError::Config(format!(
                    "sequence '{}': phase '{}' cannot be declared",
                    self.name, phase.phase
                )));
            }
            if phase.phase.rank() < last.rank() {
                return Err(EolError::Config(format!(
                    "sequence '{}': phase '{}' declared after '{}'",
                    self.name, phase.phase, last
                )));
            }
            if phase.timeout_ms == 0 {
                return Err(EolError::Config(format!(
                    "sequence '{}': phase '{}' has a zero timeout",
                    self.name, phase.phase
                )));
            }
            last = phase.phase;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(phase: TestPhase, required: Vec<DeviceKind>) -> PhaseSpec {
        PhaseSpec {
            phase,
            required,
            timeout_ms: 1000,
            steps: vec![],
        }
    }

    #[test]
    fn test_required_devices_union() {
        let mut prep = phase(TestPhase::Preparing, vec![DeviceKind::PowerSupply]);
        prep.steps.push(Step::Actuate {
            device: DeviceKind::LoadCell,
            action: Action::Zero,
        });
        let exec = phase(
            TestPhase::Executing,
            vec![DeviceKind::PowerSupply, DeviceKind::Motion],
        );
        let spec = SequenceSpec {
            name: "force".into(),
            connect_timeout_ms: 1000,
            evaluate_timeout_ms: 1000,
            phases: vec![prep, exec],
            limits: vec![],
        };

        assert_eq!(
            spec.required_devices(),
            vec![
                DeviceKind::Motion,
                DeviceKind::LoadCell,
                DeviceKind::PowerSupply
            ]
        );
    }

    #[test]
    fn test_validate_rejects_backwards_phases() {
        let spec = SequenceSpec {
            name: "bad".into(),
            connect_timeout_ms: 1000,
            evaluate_timeout_ms: 1000,
            phases: vec![
                phase(TestPhase::Executing, vec![]),
                phase(TestPhase::Preparing, vec![]),
            ],
            limits: vec![],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_implicit_phases() {
        let spec = SequenceSpec {
            name: "bad".into(),
            connect_timeout_ms: 1000,
            evaluate_timeout_ms: 1000,
            phases: vec![phase(TestPhase::Evaluating, vec![])],
            limits: vec![],
        };
        assert!(spec.validate().is_err());
    }
}
