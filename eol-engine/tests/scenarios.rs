//! Engine scenarios on mock and in-memory drivers
//!
//! Every test starts a real engine (worker thread, runtime, device table)
//! and observes it only through its events, as a presentation layer would.

use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, ErrorClass, Limit, MockConfig,
    Parameter, PhaseSpec, Reduce, RetryConfig, SequenceSpec, Step, TestPhase, Unit, Verdict,
};
use eol_engine::{
    CancelOutcome, DeviceTable, EngineEvent, ExecutionEngine, OperationId, OperationOutput,
    ProgressData, SequenceCatalog, TestResult,
};
use eol_hardware::driver::{loadcell, Bs205LoadCell, MockLoadCell, MockPowerAnalyzer, MockPowerSupply};
use eol_hardware::{Instrument, PipeTransport};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn mock(kind: DeviceKind, base: f64, unit: Option<Unit>) -> DeviceConfig {
    DeviceConfig::mock(kind).with_mock(MockConfig {
        base,
        unit,
        ..MockConfig::default()
    })
}

fn start(
    devices: Vec<Box<dyn Instrument>>,
    catalog: SequenceCatalog,
) -> (ExecutionEngine, mpsc::UnboundedReceiver<EngineEvent>) {
    let mut table = DeviceTable::new();
    for device in devices {
        table.insert(device);
    }
    let engine = ExecutionEngine::start(table, catalog).unwrap();
    let events = engine.subscribe();
    (engine, events)
}

/// Next completion or failure, skipping progress and stop notices
async fn next_terminal(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
    loop {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("no event within timeout")
            .expect("event channel closed");
        if event.is_terminal() {
            return event;
        }
    }
}

async fn expect_completed(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    id: OperationId,
) -> OperationOutput {
    match next_terminal(events).await {
        EngineEvent::OperationCompleted { id: got, output } if got == id => output,
        other => panic!("expected completion of {}, got {:?}", id, other),
    }
}

async fn expect_test(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    id: OperationId,
) -> TestResult {
    match expect_completed(events, id).await {
        OperationOutput::Test(result) => *result,
        other => panic!("expected a test result, got {:?}", other),
    }
}

fn sequence(phases: Vec<PhaseSpec>, limits: Vec<Limit>) -> SequenceSpec {
    SequenceSpec {
        name: "force".to_string(),
        connect_timeout_ms: 1_000,
        evaluate_timeout_ms: 1_000,
        phases,
        limits,
    }
}

fn phase(phase: TestPhase, timeout_ms: u64, steps: Vec<Step>) -> PhaseSpec {
    PhaseSpec {
        phase,
        required: vec![],
        timeout_ms,
        steps,
    }
}

fn sample(device: DeviceKind, channel: Channel, count: u32, reduce: Reduce) -> Step {
    Step::Sample {
        device,
        channel,
        count,
        interval_ms: 1,
        reduce,
    }
}

#[tokio::test]
async fn test_mock_load_cell_reading() {
    let cell = MockLoadCell::new(&mock(DeviceKind::LoadCell, 2.5, Some(Unit::Newton)));
    let (engine, mut events) = start(vec![Box::new(cell)], SequenceCatalog::new());

    let connect = engine.submit_connect(DeviceKind::LoadCell).unwrap();
    let read = engine
        .submit_read(DeviceKind::LoadCell, Channel::Force)
        .unwrap();

    expect_completed(&mut events, connect).await;
    match expect_completed(&mut events, read).await {
        OperationOutput::Reading(reading) => {
            assert_eq!(reading.value, 2.5);
            assert_eq!(reading.unit, Unit::Newton);
        }
        other => panic!("unexpected output {:?}", other),
    }
}

#[tokio::test]
async fn test_power_analyzer_follows_voltage_setpoint() {
    let config = DeviceConfig::mock(DeviceKind::PowerAnalyzer).with_mock(MockConfig {
        noise: 0.05,
        seed: Some(7),
        ..MockConfig::default()
    });
    let analyzer = MockPowerAnalyzer::new(&config);
    let (engine, mut events) = start(vec![Box::new(analyzer)], SequenceCatalog::new());

    engine.submit_connect(DeviceKind::PowerAnalyzer).unwrap();
    engine
        .submit_set(DeviceKind::PowerAnalyzer, Parameter::Voltage, 24.0)
        .unwrap();
    let read = engine
        .submit_read(DeviceKind::PowerAnalyzer, Channel::Voltage)
        .unwrap();

    next_terminal(&mut events).await;
    next_terminal(&mut events).await;
    match expect_completed(&mut events, read).await {
        OperationOutput::Reading(reading) => {
            assert!((reading.value - 24.0).abs() <= 0.05, "{}", reading.value);
            assert_eq!(reading.unit, Unit::Volt);
        }
        other => panic!("unexpected output {:?}", other),
    }
}

#[tokio::test]
async fn test_mock_reads_stay_within_noise_bound() {
    let config = DeviceConfig::mock(DeviceKind::LoadCell).with_mock(MockConfig {
        base: 2.5,
        noise: 0.1,
        ..MockConfig::default()
    });
    let (engine, mut events) = start(
        vec![Box::new(MockLoadCell::new(&config))],
        SequenceCatalog::new(),
    );

    engine.submit_connect(DeviceKind::LoadCell).unwrap();
    next_terminal(&mut events).await;

    for _ in 0..25 {
        engine
            .submit_read(DeviceKind::LoadCell, Channel::Force)
            .unwrap();
    }
    for _ in 0..25 {
        match next_terminal(&mut events).await {
            EngineEvent::OperationCompleted {
                output: OperationOutput::Reading(reading),
                ..
            } => assert!((2.4..=2.6).contains(&reading.value), "{}", reading.value),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_connect_failure_faults_without_measurements() {
    let failing = DeviceConfig::mock(DeviceKind::LoadCell).with_mock(MockConfig {
        fail_connect: true,
        ..MockConfig::default()
    });
    let cell = MockLoadCell::new(&failing);
    let supply = MockPowerSupply::new(&mock(DeviceKind::PowerSupply, 24.0, None));
    let (cell_probe, supply_probe) = (cell.probe(), supply.probe());

    let spec = sequence(
        vec![phase(
            TestPhase::Executing,
            1_000,
            vec![
                Step::Actuate {
                    device: DeviceKind::PowerSupply,
                    action: Action::OutputOn,
                },
                sample(DeviceKind::LoadCell, Channel::Force, 1, Reduce::Each),
            ],
        )],
        vec![],
    );
    let catalog = SequenceCatalog::from_specs([spec]).unwrap();
    let (engine, mut events) = start(vec![Box::new(cell), Box::new(supply)], catalog);

    let id = engine.submit_test("force", "SN-0001").unwrap();
    let result = expect_test(&mut events, id).await;

    assert_eq!(result.terminal, TestPhase::Faulted);
    assert_eq!(result.verdict, Verdict::Error);
    assert!(result.measurements.is_empty());
    let error = result.error.unwrap();
    assert_eq!(error.code, 202);
    assert_eq!(error.classification, ErrorClass::Fatal);

    assert_eq!(cell_probe.make_safe_calls(), 1);
    assert_eq!(supply_probe.make_safe_calls(), 1);
    assert_eq!(supply_probe.connects(), 0);
}

#[tokio::test]
async fn test_connect_timeout_leaves_device_faulted() {
    let slow = DeviceConfig::mock(DeviceKind::LoadCell).with_mock(MockConfig {
        connect_delay_ms: 300,
        ..MockConfig::default()
    });
    let cell = MockLoadCell::new(&slow);
    let counters = cell.probe();

    let mut executing = phase(
        TestPhase::Executing,
        1_000,
        vec![sample(DeviceKind::LoadCell, Channel::Force, 1, Reduce::Each)],
    );
    executing.required = vec![DeviceKind::LoadCell];
    let mut spec = sequence(vec![executing], vec![]);
    spec.connect_timeout_ms = 50;
    let catalog = SequenceCatalog::from_specs([spec]).unwrap();
    let (engine, mut events) = start(vec![Box::new(cell)], catalog);

    let id = engine.submit_test("force", "SN-0010").unwrap();
    let result = expect_test(&mut events, id).await;
    assert_eq!(result.terminal, TestPhase::Faulted);
    assert_eq!(result.error.unwrap().code, 100);
    assert_eq!(counters.connects(), 0);

    let check = engine
        .submit_operation("inspect load cell", |bench| {
            Box::pin(async move {
                let device = bench.device(DeviceKind::LoadCell)?;
                Ok(OperationOutput::Value(serde_json::json!({
                    "status": device.status().as_str(),
                    "error": device.last_error().map(|e| e.code),
                })))
            })
        })
        .unwrap();
    match expect_completed(&mut events, check).await {
        OperationOutput::Value(value) => {
            assert_eq!(value["status"], DeviceStatus::Faulted.as_str());
            assert!(!value["error"].is_null());
        }
        other => panic!("unexpected output {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_queued_operation() {
    let (engine, mut events) = start(vec![], SequenceCatalog::new());

    let (started_tx, started_rx) = oneshot::channel();
    let blocker = engine
        .submit_operation("blocker", move |_| {
            Box::pin(async move {
                let _ = started_tx.send(());
                sleep(Duration::from_millis(200)).await;
                Ok(OperationOutput::Done)
            })
        })
        .unwrap();
    let victim = engine
        .submit_operation("victim", |_| Box::pin(async move { Ok(OperationOutput::Done) }))
        .unwrap();
    let last = engine
        .submit_operation("last", |_| Box::pin(async move { Ok(OperationOutput::Done) }))
        .unwrap();

    started_rx.await.unwrap();
    let queued = engine.queue_len();
    assert_eq!(engine.cancel(victim), CancelOutcome::Removed);
    assert_eq!(engine.queue_len(), queued - 1);
    assert_eq!(engine.cancel(victim), CancelOutcome::NotFound);

    expect_completed(&mut events, blocker).await;
    expect_completed(&mut events, last).await;
    let straggler = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(straggler.is_err(), "unexpected event {:?}", straggler);
}

#[tokio::test]
async fn test_events_arrive_in_submission_order() {
    let (engine, mut events) = start(vec![], SequenceCatalog::new());

    let mut submitted = Vec::new();
    for n in 0..20u64 {
        let id = engine
            .submit_operation(format!("step {}", n), move |_| {
                Box::pin(async move {
                    sleep(Duration::from_millis(20 - n)).await;
                    Ok(OperationOutput::Value(serde_json::json!(n)))
                })
            })
            .unwrap();
        submitted.push(id);
    }

    let mut seen = Vec::new();
    for _ in 0..submitted.len() {
        seen.push(next_terminal(&mut events).await.operation().unwrap());
    }
    assert_eq!(seen, submitted);
}

#[tokio::test]
async fn test_emergency_stop_preempts_and_latches() {
    let supply = MockPowerSupply::new(&mock(DeviceKind::PowerSupply, 24.0, None));
    let probe = supply.probe();
    let (engine, mut events) = start(vec![Box::new(supply)], SequenceCatalog::new());

    engine.submit_connect(DeviceKind::PowerSupply).unwrap();
    engine
        .submit_actuate(DeviceKind::PowerSupply, Action::OutputOn)
        .unwrap();
    next_terminal(&mut events).await;
    next_terminal(&mut events).await;

    let (started_tx, started_rx) = oneshot::channel();
    let long = engine
        .submit_operation("long", move |_| {
            Box::pin(async move {
                let _ = started_tx.send(());
                sleep(Duration::from_secs(30)).await;
                Ok(OperationOutput::Done)
            })
        })
        .unwrap();
    let queued = engine
        .submit_read(DeviceKind::PowerSupply, Channel::Voltage)
        .unwrap();
    started_rx.await.unwrap();

    let report = engine.emergency_stop();
    assert_eq!(report.interrupted, Some(long));
    assert_eq!(report.tripped, vec![DeviceKind::PowerSupply]);
    assert!(report.is_clean());
    assert!(engine.is_emergency_stopped());
    assert_eq!(probe.emergency_stops(), 1);

    match next_terminal(&mut events).await {
        EngineEvent::OperationCompleted {
            id,
            output: OperationOutput::EmergencyStop(_),
        } => assert_eq!(id, long),
        other => panic!("expected stop report first, got {:?}", other),
    }
    match next_terminal(&mut events).await {
        EngineEvent::OperationFailed { id, error } => {
            assert_eq!(id, queued);
            assert_eq!(error.code, 602);
        }
        other => panic!("expected refusal, got {:?}", other),
    }

    engine.reset_emergency();
    let read = engine
        .submit_read(DeviceKind::PowerSupply, Channel::Voltage)
        .unwrap();
    match expect_completed(&mut events, read).await {
        OperationOutput::Reading(reading) => assert_eq!(reading.value, 0.0),
        other => panic!("unexpected output {:?}", other),
    }
}

#[tokio::test]
async fn test_silent_serial_device_times_out_and_engine_continues() {
    let transport = PipeTransport::new("bs205", loadcell::framing());
    let _device_end = transport.pipe();
    let mut config = DeviceConfig::mock(DeviceKind::LoadCell);
    config.retry = RetryConfig {
        connect_attempts: 1,
        command_timeout_ms: 50,
        command_retries: 0,
        ..RetryConfig::default()
    };
    config.options.min_command_interval_ms = 0;
    let cell = Bs205LoadCell::with_transport(transport, &config);
    let (engine, mut events) = start(vec![Box::new(cell)], SequenceCatalog::new());

    let connect = engine.submit_connect(DeviceKind::LoadCell).unwrap();
    expect_completed(&mut events, connect).await;

    let started = Instant::now();
    let read = engine
        .submit_read(DeviceKind::LoadCell, Channel::Force)
        .unwrap();
    let after = engine
        .submit_operation("after", |_| Box::pin(async move { Ok(OperationOutput::Done) }))
        .unwrap();

    match next_terminal(&mut events).await {
        EngineEvent::OperationFailed { id, error } => {
            assert_eq!(id, read);
            assert_eq!(error.classification, ErrorClass::Transient);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    expect_completed(&mut events, after).await;
}

#[tokio::test]
async fn test_panicking_task_is_isolated() {
    let (engine, mut events) = start(vec![], SequenceCatalog::new());

    let sensor: Option<f64> = None;
    let broken = engine
        .submit_operation("broken", move |_| {
            Box::pin(async move {
                let value = sensor.expect("sensor returned nothing");
                Ok(OperationOutput::Value(serde_json::json!(value)))
            })
        })
        .unwrap();
    let next = engine
        .submit_operation("next", |_| Box::pin(async move { Ok(OperationOutput::Done) }))
        .unwrap();

    match next_terminal(&mut events).await {
        EngineEvent::OperationFailed { id, error } => {
            assert_eq!(id, broken);
            assert_eq!(error.code, 604);
            assert!(error.message.contains("sensor returned nothing"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    expect_completed(&mut events, next).await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let cell = MockLoadCell::new(&mock(DeviceKind::LoadCell, 1.0, None));
    let probe = cell.probe();
    let (engine, mut events) = start(vec![Box::new(cell)], SequenceCatalog::new());

    let first = engine.submit_disconnect(DeviceKind::LoadCell).unwrap();
    let second = engine.submit_disconnect(DeviceKind::LoadCell).unwrap();
    expect_completed(&mut events, first).await;
    expect_completed(&mut events, second).await;
    assert_eq!(probe.disconnects(), 0);

    let missing = engine.submit_disconnect(DeviceKind::Motion).unwrap();
    match next_terminal(&mut events).await {
        EngineEvent::OperationFailed { id, error } => {
            assert_eq!(id, missing);
            assert_eq!(error.code, 502);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_sequence_passes_and_reports_phases() {
    let cell = MockLoadCell::new(&mock(DeviceKind::LoadCell, 2.5, Some(Unit::Newton)));
    let supply = MockPowerSupply::new(&mock(DeviceKind::PowerSupply, 12.0, None));
    let (cell_probe, supply_probe) = (cell.probe(), supply.probe());

    let spec = sequence(
        vec![
            phase(
                TestPhase::Preparing,
                1_000,
                vec![
                    Step::Set {
                        device: DeviceKind::PowerSupply,
                        parameter: Parameter::Voltage,
                        value: 24.0,
                    },
                    Step::Actuate {
                        device: DeviceKind::PowerSupply,
                        action: Action::OutputOn,
                    },
                ],
            ),
            phase(
                TestPhase::Executing,
                1_000,
                vec![
                    Step::Settle { ms: 5 },
                    sample(DeviceKind::LoadCell, Channel::Force, 3, Reduce::Peak),
                    sample(DeviceKind::PowerSupply, Channel::Voltage, 2, Reduce::Mean),
                ],
            ),
        ],
        vec![
            Limit {
                device: DeviceKind::LoadCell,
                unit: Unit::Newton,
                min: Some(2.0),
                max: Some(3.0),
            },
            Limit {
                device: DeviceKind::PowerSupply,
                unit: Unit::Volt,
                min: Some(23.5),
                max: Some(24.5),
            },
        ],
    );
    let catalog = SequenceCatalog::from_specs([spec]).unwrap();
    let (engine, mut events) = start(vec![Box::new(cell), Box::new(supply)], catalog);

    let id = engine.submit_test("force", "SN-0002").unwrap();

    let mut entered = Vec::new();
    let mut measured = 0;
    let result = loop {
        let event = timeout(EVENT_TIMEOUT, events.recv()).await.unwrap().unwrap();
        match event {
            EngineEvent::TestProgress { phase, data, .. } => match data {
                ProgressData::PhaseEntered => entered.push(phase),
                ProgressData::Measurement(_) => measured += 1,
                ProgressData::PhaseFinished(_) => {}
            },
            EngineEvent::OperationCompleted {
                id: done,
                output: OperationOutput::Test(result),
            } if done == id => break *result,
            other => panic!("unexpected event {:?}", other),
        }
    };

    assert!(result.passed(), "{:?}", result.verdict);
    assert_eq!(result.terminal, TestPhase::Completed);
    assert_eq!(result.measurements.len(), 2);
    assert_eq!(measured, 2);
    assert_eq!(
        entered,
        vec![
            TestPhase::Connecting,
            TestPhase::Preparing,
            TestPhase::Executing,
            TestPhase::Evaluating,
            TestPhase::Completed,
        ]
    );
    assert_eq!(result.phase_timings.len(), 4);
    assert_eq!(cell_probe.make_safe_calls(), 1);
    assert_eq!(supply_probe.make_safe_calls(), 1);
}

#[tokio::test]
async fn test_out_of_limit_completes_with_failure() {
    let cell = MockLoadCell::new(&mock(DeviceKind::LoadCell, 5.0, Some(Unit::Newton)));
    let spec = sequence(
        vec![phase(
            TestPhase::Executing,
            1_000,
            vec![sample(DeviceKind::LoadCell, Channel::Force, 1, Reduce::Each)],
        )],
        vec![Limit {
            device: DeviceKind::LoadCell,
            unit: Unit::Newton,
            min: None,
            max: Some(3.0),
        }],
    );
    let catalog = SequenceCatalog::from_specs([spec]).unwrap();
    let (engine, mut events) = start(vec![Box::new(cell)], catalog);

    let id = engine.submit_test("force", "SN-0003").unwrap();
    let result = expect_test(&mut events, id).await;

    assert_eq!(result.terminal, TestPhase::Completed);
    assert!(matches!(result.verdict, Verdict::Fail { .. }));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_phase_timeout_aborts_and_cleans_up() {
    let supply = MockPowerSupply::new(&mock(DeviceKind::PowerSupply, 24.0, None));
    let probe = supply.probe();
    let spec = sequence(
        vec![phase(
            TestPhase::Executing,
            50,
            vec![
                Step::Actuate {
                    device: DeviceKind::PowerSupply,
                    action: Action::OutputOn,
                },
                Step::Settle { ms: 1_000 },
            ],
        )],
        vec![],
    );
    let catalog = SequenceCatalog::from_specs([spec]).unwrap();
    let (engine, mut events) = start(vec![Box::new(supply)], catalog);

    let started = Instant::now();
    let id = engine.submit_test("force", "SN-0004").unwrap();
    let result = expect_test(&mut events, id).await;

    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(result.terminal, TestPhase::Aborted);
    assert_eq!(result.error.unwrap().code, 601);
    assert_eq!(probe.make_safe_calls(), 1);

    let read = engine
        .submit_read(DeviceKind::PowerSupply, Channel::Voltage)
        .unwrap();
    match expect_completed(&mut events, read).await {
        OperationOutput::Reading(reading) => assert_eq!(reading.value, 0.0),
        other => panic!("unexpected output {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_running_test_still_cleans_up() {
    let supply = MockPowerSupply::new(&mock(DeviceKind::PowerSupply, 24.0, None));
    let probe = supply.probe();
    let mut executing = phase(
        TestPhase::Executing,
        20_000,
        vec![Step::Settle { ms: 10_000 }],
    );
    executing.required = vec![DeviceKind::PowerSupply];
    let spec = sequence(vec![executing], vec![]);
    let catalog = SequenceCatalog::from_specs([spec]).unwrap();
    let (engine, mut events) = start(vec![Box::new(supply)], catalog);

    let id = engine.submit_test("force", "SN-0005").unwrap();
    loop {
        let event = timeout(EVENT_TIMEOUT, events.recv()).await.unwrap().unwrap();
        if let EngineEvent::TestProgress {
            phase: TestPhase::Executing,
            data: ProgressData::PhaseEntered,
            ..
        } = event
        {
            break;
        }
    }

    assert_eq!(engine.cancel(id), CancelOutcome::Signalled);
    let result = expect_test(&mut events, id).await;
    assert_eq!(result.terminal, TestPhase::Aborted);
    assert_eq!(result.error.unwrap().code, 600);
    assert_eq!(probe.make_safe_calls(), 1);
}

#[tokio::test]
async fn test_reconfigure_swaps_driver() {
    let old = MockLoadCell::new(&mock(DeviceKind::LoadCell, 1.0, Some(Unit::Newton)));
    let old_probe = old.probe();
    let (engine, mut events) = start(vec![Box::new(old)], SequenceCatalog::new());

    engine.submit_connect(DeviceKind::LoadCell).unwrap();
    let swap = engine
        .submit_reconfigure(mock(DeviceKind::LoadCell, 3.0, Some(Unit::Newton)))
        .unwrap();
    engine.submit_connect(DeviceKind::LoadCell).unwrap();
    let read = engine
        .submit_read(DeviceKind::LoadCell, Channel::Force)
        .unwrap();

    next_terminal(&mut events).await;
    assert_eq!(
        expect_completed(&mut events, swap).await,
        OperationOutput::Reconfigured(DeviceKind::LoadCell)
    );
    next_terminal(&mut events).await;
    match expect_completed(&mut events, read).await {
        OperationOutput::Reading(reading) => assert_eq!(reading.value, 3.0),
        other => panic!("unexpected output {:?}", other),
    }
    assert_eq!(old_probe.disconnects(), 1);
    assert_eq!(old_probe.make_safe_calls(), 1);
}

#[tokio::test]
async fn test_unknown_sequence_rejected_at_submission() {
    let (engine, _events) = start(vec![], SequenceCatalog::new());
    let err = engine.submit_test("missing", "SN-0006").unwrap_err();
    assert!(err.to_string().contains("missing"));
    assert_eq!(engine.queue_len(), 0);
}

#[test]
fn test_shutdown_drains_queue_and_disconnects() {
    let cell = MockLoadCell::new(&mock(DeviceKind::LoadCell, 1.0, None));
    let probe = cell.probe();
    let (engine, mut events) = start(vec![Box::new(cell)], SequenceCatalog::new());

    engine.submit_connect(DeviceKind::LoadCell).unwrap();
    for _ in 0..3 {
        engine
            .submit_read(DeviceKind::LoadCell, Channel::Force)
            .unwrap();
    }
    tokio_test::assert_ok!(engine.shutdown());

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, EngineEvent::OperationCompleted { .. }));
        completed += 1;
    }
    assert_eq!(completed, 4);
    assert_eq!(probe.disconnects(), 1);
    assert_eq!(probe.make_safe_calls(), 1);
    assert!(!engine.is_running());
    assert!(engine.submit_connect(DeviceKind::LoadCell).is_err());
}
