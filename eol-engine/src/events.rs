//! Events delivered to subscribers
//!
//! Completion crosses back to callers only through these events; nothing in
//! the engine or the drivers holds a reference into presentation code.

use crate::context::PhaseTiming;
use crate::operation::{EmergencyStopReport, OperationId, OperationOutput};
use eol_core::{ErrorRecord, Measurement, TestPhase};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    OperationCompleted {
        id: OperationId,
        output: OperationOutput,
    },
    OperationFailed {
        id: OperationId,
        error: ErrorRecord,
    },
    TestProgress {
        id: OperationId,
        phase: TestPhase,
        data: ProgressData,
    },
    /// Emitted once per emergency stop, after all stoppers were tripped
    EmergencyStopped(EmergencyStopReport),
}

impl EngineEvent {
    /// Operation this event reports on, if any
    pub fn operation(&self) -> Option<OperationId> {
        match self {
            EngineEvent::OperationCompleted { id, .. }
            | EngineEvent::OperationFailed { id, .. }
            | EngineEvent::TestProgress { id, .. } => Some(*id),
            EngineEvent::EmergencyStopped(_) => None,
        }
    }

    /// Completion or failure; exactly one fires per started operation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::OperationCompleted { .. } | EngineEvent::OperationFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressData {
    PhaseEntered,
    Measurement(Measurement),
    PhaseFinished(PhaseTiming),
}

/// Fan-out to every live subscriber. Closed receivers are dropped on the
/// next emit.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
