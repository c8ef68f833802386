//! The unified execution engine
//!
//! One dedicated worker thread owns one current-thread tokio runtime and the
//! device table for the lifetime of the engine. Callers enqueue operations
//! from any thread and return immediately; the worker pops them in FIFO
//! order and runs each to completion before the next, so two hardware calls
//! never interleave. Results come back only as [`EngineEvent`]s.
//!
//! Emergency stop is the one path that does not queue: it trips every
//! driver's out-of-band stopper from the calling thread, cancels whatever
//! is running and latches the engine until [`ExecutionEngine::reset_emergency`].

use crate::catalog::{CatalogEntry, SequenceCatalog};
use crate::criteria::Criteria;
use crate::devices::DeviceTable;
use crate::events::{EngineEvent, EventBus, ProgressData};
use crate::operation::{
    CancelOutcome, EmergencyStopReport, Operation, OperationId, OperationKind, OperationOutput,
    StopFailure, Task, TaskFuture,
};
use crate::runner;
use chrono::Utc;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, EolError, Parameter, Result, SequenceSpec,
    TestPhase,
};
use eol_hardware::{build_driver, EmergencyStop, Instrument};
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type StopperSet = Arc<Mutex<Vec<Arc<dyn EmergencyStop>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Entry {
    Run(Operation),
    /// Stops the worker once everything queued before it has run
    Shutdown,
}

struct InFlight {
    id: OperationId,
    token: CancellationToken,
}

struct Shared {
    queue: Mutex<VecDeque<Entry>>,
    wakeup: Notify,
    events: EventBus,
    in_flight: Mutex<Option<InFlight>>,
    stoppers: StopperSet,
    estop: AtomicBool,
    accepting: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    async fn next_entry(&self) -> Entry {
        loop {
            if let Some(entry) = lock(&self.queue).pop_front() {
                return entry;
            }
            self.wakeup.notified().await;
        }
    }

    /// Clear the in-flight slot if it still belongs to `id`. False means an
    /// emergency stop already reported on this operation.
    fn release(&self, id: OperationId) -> bool {
        let mut slot = lock(&self.in_flight);
        match slot.as_ref() {
            Some(flight) if flight.id == id => {
                slot.take();
                true
            }
            _ => false,
        }
    }
}

/// Everything a task may touch while it runs on the worker
pub struct Workbench {
    devices: DeviceTable,
    events: EventBus,
    stoppers: StopperSet,
    cancel: CancellationToken,
    operation: OperationId,
    pending_evaluation: bool,
}

impl Workbench {
    fn new(devices: DeviceTable, events: EventBus, stoppers: StopperSet) -> Self {
        Self {
            devices,
            events,
            stoppers,
            cancel: CancellationToken::new(),
            operation: OperationId(0),
            pending_evaluation: false,
        }
    }

    fn begin(&mut self, operation: OperationId, cancel: CancellationToken) {
        self.operation = operation;
        self.cancel = cancel;
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn devices(&mut self) -> &mut DeviceTable {
        &mut self.devices
    }

    pub fn device(&mut self, kind: DeviceKind) -> Result<&mut dyn Instrument> {
        self.devices.get(kind)
    }

    /// Token of the running operation; cancelled by `cancel`, `cancel_all`
    /// and emergency stop
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` if the running operation was cancelled
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EolError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn progress(&self, phase: TestPhase, data: ProgressData) {
        self.events.emit(EngineEvent::TestProgress {
            id: self.operation,
            phase,
            data,
        });
    }

    /// True while a test holds measurements that were not evaluated yet
    pub fn pending_evaluation(&self) -> bool {
        self.pending_evaluation
    }

    pub(crate) fn set_pending_evaluation(&mut self, pending: bool) {
        self.pending_evaluation = pending;
    }

    /// Swap the driver for `config.kind`. The old driver is made safe and
    /// disconnected first.
    pub async fn replace_device(&mut self, config: &DeviceConfig) -> Result<()> {
        if self.pending_evaluation {
            return Err(EolError::Busy(format!(
                "{} has measurements pending evaluation",
                config.kind
            )));
        }
        let driver = build_driver(config)?;
        let released = match self.devices.insert(driver) {
            Some(mut old) => {
                if let Err(e) = old.make_safe().await {
                    warn!("{} could not be made safe before swap: {}", config.kind, e);
                }
                old.disconnect().await
            }
            None => Ok(()),
        };
        // the new driver is installed either way; its stopper must be live
        *lock(&self.stoppers) = self.devices.stoppers();
        released?;
        info!("{} reconfigured", config.kind);
        Ok(())
    }
}

/// Box a closure as a [`Task`]
pub fn task<F>(f: F) -> Task
where
    F: for<'a> FnOnce(&'a mut Workbench) -> TaskFuture<'a> + Send + 'static,
{
    Box::new(f)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn run_worker(shared: Arc<Shared>, mut bench: Workbench) {
    info!("Execution engine worker started");
    loop {
        match shared.next_entry().await {
            Entry::Run(operation) => execute(&shared, &mut bench, operation).await,
            Entry::Shutdown => break,
        }
    }

    bench.devices.make_safe_all().await;
    bench.devices.disconnect_all().await;
    info!("Execution engine worker stopped");
}

async fn execute(shared: &Shared, bench: &mut Workbench, operation: Operation) {
    let Operation {
        id,
        name,
        kind,
        task: work,
        ..
    } = operation;

    let token = CancellationToken::new();
    *lock(&shared.in_flight) = Some(InFlight {
        id,
        token: token.clone(),
    });

    if shared.estop.load(Ordering::SeqCst) {
        if shared.release(id) {
            warn!("{} ({}) refused: emergency stop active", id, name);
            shared.events.emit(EngineEvent::OperationFailed {
                id,
                error: EolError::EmergencyStopActive.to_record(),
            });
        }
        return;
    }

    debug!("{} ({}) started", id, name);
    bench.begin(id, token.clone());
    let guarded = AssertUnwindSafe(work(bench)).catch_unwind();
    let outcome = match kind {
        // test runs observe the token themselves so cleanup still runs
        OperationKind::TestRun => guarded.await,
        _ => tokio::select! {
            outcome = guarded => outcome,
            _ = token.cancelled() => Ok(Err(EolError::Cancelled)),
        },
    };
    let result = outcome.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!("{} ({}) panicked: {}", id, name, message);
        Err(EolError::Panicked(message))
    });
    bench.set_pending_evaluation(false);

    if !shared.release(id) {
        info!("{} ({}) finished after emergency stop; result dropped", id, name);
        return;
    }
    let event = match result {
        Ok(output) => {
            debug!("{} ({}) completed", id, name);
            EngineEvent::OperationCompleted { id, output }
        }
        Err(e) => {
            warn!("{} ({}) failed: {}", id, name, e);
            EngineEvent::OperationFailed {
                id,
                error: e.to_record(),
            }
        }
    };
    shared.events.emit(event);
}

/// Handle to the engine. Cheap to share behind an `Arc`; every method
/// returns without waiting for hardware.
pub struct ExecutionEngine {
    shared: Arc<Shared>,
    catalog: Arc<SequenceCatalog>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionEngine {
    /// Spawn the worker thread with its runtime. The device table moves
    /// onto the worker and lives until [`shutdown`](Self::shutdown).
    pub fn start(devices: DeviceTable, catalog: SequenceCatalog) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let stoppers: StopperSet = Arc::new(Mutex::new(devices.stoppers()));
        let events = EventBus::default();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            events: events.clone(),
            in_flight: Mutex::new(None),
            stoppers: stoppers.clone(),
            estop: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        info!(
            "Starting execution engine: {} device(s), {} sequence(s)",
            devices.len(),
            catalog.len()
        );
        let bench = Workbench::new(devices, events, stoppers);
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("eol-engine".to_string())
            .spawn(move || runtime.block_on(run_worker(worker_shared, bench)))?;

        Ok(Self {
            shared,
            catalog: Arc::new(catalog),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn catalog(&self) -> &SequenceCatalog {
        &self.catalog
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.shared.queue)
            .iter()
            .filter(|entry| matches!(entry, Entry::Run(_)))
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.shared.estop.load(Ordering::SeqCst)
    }

    fn enqueue(&self, name: String, kind: OperationKind, task: Task) -> Result<OperationId> {
        let id = OperationId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut queue = lock(&self.shared.queue);
            // checked under the queue lock so nothing lands behind the sentinel
            if !self.shared.accepting.load(Ordering::SeqCst) {
                return Err(EolError::EngineStopped);
            }
            queue.push_back(Entry::Run(Operation {
                id,
                name,
                kind,
                submitted_at: Utc::now(),
                task,
            }));
        }
        self.shared.wakeup.notify_one();
        Ok(id)
    }

    /// Queue an arbitrary task. Completion arrives as an event.
    pub fn submit_operation<F>(&self, name: impl Into<String>, f: F) -> Result<OperationId>
    where
        F: for<'a> FnOnce(&'a mut Workbench) -> TaskFuture<'a> + Send + 'static,
    {
        let name = name.into();
        debug!("Submitting operation '{}'", name);
        self.enqueue(name, OperationKind::HardwareCall, task(f))
    }

    pub fn submit_connect(&self, device: DeviceKind) -> Result<OperationId> {
        self.submit_operation(format!("connect {}", device), move |bench| {
            Box::pin(async move {
                bench.device(device)?.connect().await?;
                Ok(OperationOutput::Done)
            })
        })
    }

    /// Connect every device in the table; fails if any device fails
    pub fn submit_connect_all(&self) -> Result<OperationId> {
        self.submit_operation("connect all", |bench| {
            Box::pin(async move {
                let failures = bench.devices().connect_all().await;
                match failures.into_iter().next() {
                    None => Ok(OperationOutput::Done),
                    Some((device, record)) => Err(EolError::ConnectionFailed {
                        target: device.to_string(),
                        attempts: 1,
                        reason: record.message,
                    }),
                }
            })
        })
    }

    pub fn submit_disconnect(&self, device: DeviceKind) -> Result<OperationId> {
        self.submit_operation(format!("disconnect {}", device), move |bench| {
            Box::pin(async move {
                bench.device(device)?.disconnect().await?;
                Ok(OperationOutput::Done)
            })
        })
    }

    pub fn submit_read(&self, device: DeviceKind, channel: Channel) -> Result<OperationId> {
        self.submit_operation(format!("read {} {:?}", device, channel), move |bench| {
            Box::pin(async move {
                let reading = bench.device(device)?.read_measurement(channel).await?;
                Ok(OperationOutput::Reading(reading))
            })
        })
    }

    pub fn submit_set(
        &self,
        device: DeviceKind,
        parameter: Parameter,
        value: f64,
    ) -> Result<OperationId> {
        self.submit_operation(
            format!("set {} {:?}={}", device, parameter, value),
            move |bench| {
                Box::pin(async move {
                    bench.device(device)?.set_parameter(parameter, value).await?;
                    Ok(OperationOutput::Done)
                })
            },
        )
    }

    pub fn submit_actuate(&self, device: DeviceKind, action: Action) -> Result<OperationId> {
        self.submit_operation(format!("actuate {} {:?}", device, action), move |bench| {
            Box::pin(async move {
                bench.device(device)?.actuate(action).await?;
                Ok(OperationOutput::Done)
            })
        })
    }

    /// Queue a catalogued sequence as one operation. Unknown names fail
    /// here, before anything is queued.
    pub fn submit_test(&self, sequence: &str, dut: impl Into<String>) -> Result<OperationId> {
        let CatalogEntry { spec, criteria } = self
            .catalog
            .get(sequence)
            .cloned()
            .ok_or_else(|| EolError::Config(format!("unknown sequence '{}'", sequence)))?;
        self.queue_test(spec, criteria, dut.into())
    }

    /// Queue an ad-hoc sequence with its own criteria
    pub fn submit_test_spec(
        &self,
        spec: SequenceSpec,
        criteria: Arc<dyn Criteria>,
        dut: impl Into<String>,
    ) -> Result<OperationId> {
        spec.validate()?;
        self.queue_test(Arc::new(spec), criteria, dut.into())
    }

    fn queue_test(
        &self,
        spec: Arc<SequenceSpec>,
        criteria: Arc<dyn Criteria>,
        dut: String,
    ) -> Result<OperationId> {
        let name = format!("test {} ({})", spec.name, dut);
        info!("Submitting {}", name);
        self.enqueue(
            name,
            OperationKind::TestRun,
            task(move |bench| {
                Box::pin(async move {
                    let result = runner::run_sequence(bench, &spec, criteria.as_ref(), dut).await;
                    Ok(OperationOutput::Test(Box::new(result)))
                })
            }),
        )
    }

    /// Queue a driver swap. Runs after the current operation finishes.
    pub fn submit_reconfigure(&self, config: DeviceConfig) -> Result<OperationId> {
        let kind = config.kind;
        self.enqueue(
            format!("reconfigure {}", kind),
            OperationKind::Reconfigure,
            task(move |bench| {
                Box::pin(async move {
                    bench.replace_device(&config).await?;
                    Ok(OperationOutput::Reconfigured(kind))
                })
            }),
        )
    }

    /// Remove a queued operation or signal a running one
    pub fn cancel(&self, id: OperationId) -> CancelOutcome {
        {
            let mut queue = lock(&self.shared.queue);
            let position = queue
                .iter()
                .position(|entry| matches!(entry, Entry::Run(op) if op.id == id));
            if let Some(position) = position {
                queue.remove(position);
                info!("{} removed from queue", id);
                return CancelOutcome::Removed;
            }
        }

        match lock(&self.shared.in_flight).as_ref() {
            Some(flight) if flight.id == id => {
                flight.token.cancel();
                info!("{} cancellation signalled", id);
                CancelOutcome::Signalled
            }
            _ => CancelOutcome::NotFound,
        }
    }

    /// Drop every queued operation and signal the running one. Returns the
    /// number removed from the queue.
    pub fn cancel_all(&self) -> usize {
        let removed = {
            let mut queue = lock(&self.shared.queue);
            let before = queue.len();
            queue.retain(|entry| matches!(entry, Entry::Shutdown));
            before - queue.len()
        };
        if let Some(flight) = lock(&self.shared.in_flight).as_ref() {
            flight.token.cancel();
        }
        info!("Cancelled all operations ({} queued)", removed);
        removed
    }

    /// Trip every out-of-band stopper now, from this thread.
    ///
    /// The running operation is cancelled and reported complete with the
    /// stop report right away; later operations fail with
    /// `EmergencyStopActive` until [`reset_emergency`](Self::reset_emergency).
    pub fn emergency_stop(&self) -> EmergencyStopReport {
        self.shared.estop.store(true, Ordering::SeqCst);
        error!("EMERGENCY STOP requested");

        let stoppers = lock(&self.shared.stoppers).clone();
        let mut report = EmergencyStopReport::new();
        for stopper in stoppers {
            let device = stopper.device();
            match stopper.trip() {
                Ok(()) => report.tripped.push(device),
                Err(e) => {
                    error!("{} emergency stop failed: {}", device, e);
                    report.failures.push(StopFailure {
                        device,
                        error: e.to_record(),
                    });
                }
            }
        }

        let interrupted = lock(&self.shared.in_flight).take();
        if let Some(flight) = interrupted {
            flight.token.cancel();
            report.interrupted = Some(flight.id);
            self.shared.events.emit(EngineEvent::OperationCompleted {
                id: flight.id,
                output: OperationOutput::EmergencyStop(report.clone()),
            });
        }
        self.shared
            .events
            .emit(EngineEvent::EmergencyStopped(report.clone()));
        report
    }

    pub fn reset_emergency(&self) {
        if self.shared.estop.swap(false, Ordering::SeqCst) {
            info!("Emergency stop reset");
        }
    }

    /// Queue the sentinel, wait for the worker to drain the queue, make
    /// every device safe and disconnect it. Blocks the calling thread.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut queue = lock(&self.shared.queue);
            if !self.shared.accepting.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            queue.push_back(Entry::Shutdown);
        }
        self.shared.wakeup.notify_one();
        info!("Execution engine shutting down");

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|payload| EolError::Panicked(panic_message(payload.as_ref())))?;
        }
        Ok(())
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Execution engine shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eol_core::{DeviceStatus, ErrorRecord, Reading};
    use eol_hardware::driver::MockPowerSupply;

    /// Power supply whose session cannot be closed cleanly
    struct StuckSupply;

    #[async_trait]
    impl Instrument for StuckSupply {
        fn kind(&self) -> DeviceKind {
            DeviceKind::PowerSupply
        }

        fn model(&self) -> &'static str {
            "stuck"
        }

        fn status(&self) -> DeviceStatus {
            DeviceStatus::Connected
        }

        fn last_error(&self) -> Option<ErrorRecord> {
            None
        }

        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            Err(EolError::Network("socket wedged".into()))
        }

        async fn read_measurement(&mut self, _channel: Channel) -> Result<Reading> {
            Err(EolError::Unsupported("read".into()))
        }

        async fn set_parameter(&mut self, _parameter: Parameter, _value: f64) -> Result<()> {
            Ok(())
        }

        async fn actuate(&mut self, _action: Action) -> Result<()> {
            Ok(())
        }

        async fn emergency_stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn bench(driver: Box<dyn Instrument>) -> Workbench {
        let mut devices = DeviceTable::new();
        devices.insert(driver);
        let stoppers = Arc::new(Mutex::new(devices.stoppers()));
        Workbench::new(devices, EventBus::default(), stoppers)
    }

    #[tokio::test]
    async fn test_replace_refused_while_evaluation_pending() {
        let supply = MockPowerSupply::new(&DeviceConfig::mock(DeviceKind::PowerSupply));
        let counters = supply.probe();
        let mut bench = bench(Box::new(supply));

        bench.set_pending_evaluation(true);
        let err = bench
            .replace_device(&DeviceConfig::mock(DeviceKind::PowerSupply))
            .await
            .unwrap_err();
        assert!(matches!(err, EolError::Busy(_)));
        assert_eq!(counters.make_safe_calls(), 0);

        bench.set_pending_evaluation(false);
        bench
            .replace_device(&DeviceConfig::mock(DeviceKind::PowerSupply))
            .await
            .unwrap();
        assert_eq!(counters.make_safe_calls(), 1);
    }

    #[tokio::test]
    async fn test_stoppers_follow_swap_when_old_driver_fails_to_close() {
        let mut bench = bench(Box::new(StuckSupply));
        assert!(lock(&bench.stoppers).is_empty());

        let err = bench
            .replace_device(&DeviceConfig::mock(DeviceKind::PowerSupply))
            .await
            .unwrap_err();
        assert!(matches!(err, EolError::Network(_)));

        assert_ne!(bench.device(DeviceKind::PowerSupply).unwrap().model(), "stuck");
        let stoppers = lock(&bench.stoppers);
        assert_eq!(stoppers.len(), 1);
        assert_eq!(stoppers[0].device(), DeviceKind::PowerSupply);
    }
}
