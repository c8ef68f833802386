//! Operations: the unit of work the engine queue holds

use crate::context::TestResult;
use crate::engine::Workbench;
use chrono::{DateTime, Utc};
use eol_core::{DeviceKind, ErrorRecord, Reading, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Correlation id returned at submission and carried by every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// One or more driver calls
    HardwareCall,
    /// A whole test sequence, run back-to-back as one queue entry
    TestRun,
    /// Driver swap with new connection parameters
    Reconfigure,
}

/// Future returned by a task; borrows the workbench for its whole run
pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<OperationOutput>> + Send + 'a>>;

/// Work handed to the engine. Runs exactly once on the worker thread.
pub type Task = Box<dyn for<'a> FnOnce(&'a mut Workbench) -> TaskFuture<'a> + Send>;

/// A queued operation
pub struct Operation {
    pub id: OperationId,
    pub name: String,
    pub kind: OperationKind,
    pub submitted_at: DateTime<Utc>,
    pub(crate) task: Task,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    Done,
    Reading(Reading),
    Test(Box<TestResult>),
    Reconfigured(DeviceKind),
    /// The operation was interrupted by an emergency stop
    EmergencyStop(EmergencyStopReport),
    /// Free-form result of a custom task
    Value(serde_json::Value),
}

/// What an emergency stop reached
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyStopReport {
    pub at: DateTime<Utc>,
    pub tripped: Vec<DeviceKind>,
    pub failures: Vec<StopFailure>,
    /// Operation that was running when the stop was requested
    pub interrupted: Option<OperationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopFailure {
    pub device: DeviceKind,
    pub error: ErrorRecord,
}

impl EmergencyStopReport {
    pub(crate) fn new() -> Self {
        Self {
            at: Utc::now(),
            tripped: Vec::new(),
            failures: Vec::new(),
            interrupted: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue before it started; no event will fire
    Removed,
    /// Running; its cancel flag is set and it finishes at the next
    /// suspension point
    Signalled,
    /// Unknown or already finished
    NotFound,
}
