//! Per-run test state and the archived result

use crate::operation::OperationId;
use chrono::{DateTime, Utc};
use eol_core::{EolError, ErrorRecord, Measurement, Result, TestPhase, Verdict};
use serde::Serialize;
use tokio::time::Instant;

/// Append-only measurement list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementLog(Vec<Measurement>);

impl MeasurementLog {
    pub fn push(&mut self, measurement: Measurement) {
        self.0.push(measurement);
    }

    pub fn as_slice(&self) -> &[Measurement] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Measurement> {
        self.0
    }
}

/// Time spent in one phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseTiming {
    pub phase: TestPhase,
    pub elapsed_ms: u64,
}

/// Archived outcome of one test run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub sequence: String,
    pub dut: String,
    pub terminal: TestPhase,
    pub verdict: Verdict,
    pub measurements: Vec<Measurement>,
    pub phase_timings: Vec<PhaseTiming>,
    /// Error that ended the run early
    pub error: Option<ErrorRecord>,
    /// Devices that could not be made safe during cleanup
    pub cleanup_errors: Vec<ErrorRecord>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.terminal == TestPhase::Completed && self.verdict.is_pass()
    }
}

/// Mutable record of one run in progress
#[derive(Debug)]
pub struct TestContext {
    sequence_id: String,
    dut: String,
    operation: OperationId,
    current_phase: TestPhase,
    measurements: MeasurementLog,
    started_at: DateTime<Utc>,
    phase_started: Instant,
    timings: Vec<PhaseTiming>,
}

impl TestContext {
    pub fn new(sequence_id: impl Into<String>, dut: impl Into<String>, operation: OperationId) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            dut: dut.into(),
            operation,
            current_phase: TestPhase::Idle,
            measurements: MeasurementLog::default(),
            started_at: Utc::now(),
            phase_started: Instant::now(),
            timings: Vec::new(),
        }
    }

    pub fn sequence_id(&self) -> &str {
        &self.sequence_id
    }

    pub fn dut(&self) -> &str {
        &self.dut
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn phase(&self) -> TestPhase {
        self.current_phase
    }

    pub fn measurements(&self) -> &[Measurement] {
        self.measurements.as_slice()
    }

    pub fn record(&mut self, measurement: Measurement) {
        self.measurements.push(measurement);
    }

    /// Move to `next`. Phases only move forward (repeating a declared phase
    /// is allowed); Aborted is reachable from any non-terminal phase.
    /// Returns the timing of the phase that was left.
    pub fn advance(&mut self, next: TestPhase) -> Result<Option<PhaseTiming>> {
        let current = self.current_phase;
        if current.is_terminal() {
            return Err(EolError::InvalidInput(format!(
                "test already finished as {}",
                current
            )));
        }
        if next != TestPhase::Aborted && next.rank() < current.rank() {
            return Err(EolError::InvalidInput(format!(
                "phase {} cannot follow {}",
                next, current
            )));
        }

        let finished = (current != TestPhase::Idle).then(|| PhaseTiming {
            phase: current,
            elapsed_ms: self.phase_started.elapsed().as_millis() as u64,
        });
        if let Some(timing) = finished {
            self.timings.push(timing);
        }
        self.current_phase = next;
        self.phase_started = Instant::now();
        Ok(finished)
    }

    /// Archive the run. `terminal` must already be the current phase.
    pub fn finish(
        self,
        verdict: Verdict,
        error: Option<ErrorRecord>,
        cleanup_errors: Vec<ErrorRecord>,
    ) -> TestResult {
        TestResult {
            sequence: self.sequence_id,
            dut: self.dut,
            terminal: self.current_phase,
            verdict,
            measurements: self.measurements.into_vec(),
            phase_timings: self.timings,
            error,
            cleanup_errors,
            started: self.started_at,
            finished: Utc::now(),
        }
    }
}
