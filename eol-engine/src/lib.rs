//! eol-engine
//!
//! The single-worker execution engine and the test sequence state machine.
//! Callers submit operations and whole test runs; one worker thread with one
//! persistent runtime executes them strictly one after another against the
//! device table, and reports back through [`EngineEvent`]s.
//
//! Public API:
//! - `ExecutionEngine`: start, submit, cancel, emergency stop, shutdown
//! - `Workbench`: what a submitted task can touch while it runs
//! - `SequenceCatalog` / `Criteria`: named sequences and their evaluation
//! - `TestResult`: archived outcome of a test run
//! - `ResultArchive`: one JSON file per finished run

pub mod archive;
pub mod catalog;
pub mod context;
pub mod criteria;
pub mod devices;
pub mod engine;
pub mod events;
pub mod operation;
pub mod runner;

pub use archive::ResultArchive;
pub use catalog::{CatalogEntry, SequenceCatalog};
pub use context::{MeasurementLog, PhaseTiming, TestContext, TestResult};
pub use criteria::{AcceptAll, Criteria, LimitCriteria};
pub use devices::DeviceTable;
pub use engine::{task, ExecutionEngine, Workbench};
pub use events::{EngineEvent, EventBus, ProgressData};
pub use operation::{
    CancelOutcome, EmergencyStopReport, OperationId, OperationKind, OperationOutput, StopFailure,
    Task, TaskFuture,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_present() {
        let _ = std::any::TypeId::of::<ExecutionEngine>();
        let _ = std::any::TypeId::of::<Workbench>();
        let _ = std::any::TypeId::of::<SequenceCatalog>();
        let _ = std::any::TypeId::of::<TestResult>();
    }
}
