//! Test sequence state machine
//!
//! Idle → Connecting → Preparing → Executing → Evaluating → Completed, with
//! Aborted and Faulted reachable from any phase. A run always ends in a
//! terminal phase, and the required devices are made safe exactly once on
//! the way there, whatever caused the run to end.

use crate::context::{TestContext, TestResult};
use crate::criteria::Criteria;
use crate::engine::Workbench;
use crate::events::ProgressData;
use eol_core::{
    Channel, DeviceKind, DeviceStatus, EolError, ErrorClass, Measurement, PhaseSpec, Reading,
    Reduce, Result, SequenceSpec, Step, TestPhase, Verdict,
};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run `spec` against the workbench devices and archive the outcome
pub async fn run_sequence(
    bench: &mut Workbench,
    spec: &SequenceSpec,
    criteria: &dyn Criteria,
    dut: String,
) -> TestResult {
    let mut ctx = TestContext::new(spec.name.as_str(), dut, bench.operation());
    let required = spec.required_devices();
    info!(
        "Test '{}' on {} started ({} device(s))",
        spec.name,
        ctx.dut(),
        required.len()
    );

    let outcome = drive(bench, spec, criteria, &mut ctx, &required).await;
    let (terminal, verdict, error) = match outcome {
        Ok(verdict) => (TestPhase::Completed, verdict, None),
        Err(e) => {
            let terminal = terminal_for(&e, ctx.phase());
            warn!(
                "Test '{}' on {}: {} during {}",
                spec.name,
                ctx.dut(),
                e,
                ctx.phase()
            );
            (terminal, Verdict::Error, Some(e.to_record()))
        }
    };

    if let Err(e) = enter(bench, &mut ctx, terminal) {
        warn!("Test '{}': {}", spec.name, e);
    }
    let cleanup_errors = bench.devices().make_safe(&required).await;
    bench.set_pending_evaluation(false);

    let result = ctx.finish(verdict, error, cleanup_errors);
    info!(
        "Test '{}' on {} finished: {} ({} measurement(s))",
        result.sequence,
        result.dut,
        result.terminal,
        result.measurements.len()
    );
    result
}

/// Terminal phase for an error raised while in `phase`
fn terminal_for(error: &EolError, phase: TestPhase) -> TestPhase {
    match error {
        EolError::Cancelled | EolError::PhaseTimeout { .. } => TestPhase::Aborted,
        _ if phase == TestPhase::Connecting => TestPhase::Faulted,
        other => match other.class() {
            ErrorClass::Fatal | ErrorClass::Unsupported => TestPhase::Faulted,
            ErrorClass::Protocol | ErrorClass::Transient => TestPhase::Aborted,
        },
    }
}

async fn drive(
    bench: &mut Workbench,
    spec: &SequenceSpec,
    criteria: &dyn Criteria,
    ctx: &mut TestContext,
    required: &[DeviceKind],
) -> Result<Verdict> {
    let token = bench.cancel_token();

    enter(bench, ctx, TestPhase::Connecting)?;
    let connect_limit = Duration::from_millis(spec.connect_timeout_ms);
    bounded(&token, connect_limit, connect_required(bench, required), || {
        EolError::Timeout(format!(
            "devices not connected within {} ms",
            spec.connect_timeout_ms
        ))
    })
    .await?;

    for phase in &spec.phases {
        enter(bench, ctx, phase.phase)?;
        if phase.phase == TestPhase::Executing {
            bench.set_pending_evaluation(true);
        }
        let limit = Duration::from_millis(phase.timeout_ms);
        bounded(&token, limit, run_steps(bench, ctx, phase), || {
            EolError::PhaseTimeout {
                phase: phase.phase.to_string(),
                timeout_ms: phase.timeout_ms,
            }
        })
        .await?;
    }

    enter(bench, ctx, TestPhase::Evaluating)?;
    let evaluate_limit = Duration::from_millis(spec.evaluate_timeout_ms);
    let verdict = bounded(
        &token,
        evaluate_limit,
        criteria.evaluate(ctx.measurements()),
        || EolError::PhaseTimeout {
            phase: TestPhase::Evaluating.to_string(),
            timeout_ms: spec.evaluate_timeout_ms,
        },
    )
    .await?;
    debug!("Test '{}' verdict: {:?}", spec.name, verdict);
    Ok(verdict)
}

/// Run `work` until it finishes, `limit` passes or `token` is cancelled
async fn bounded<T, F>(
    token: &CancellationToken,
    limit: Duration,
    work: F,
    on_timeout: impl FnOnce() -> EolError,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(EolError::Cancelled),
        outcome = timeout(limit, work) => outcome.unwrap_or_else(|_| Err(on_timeout())),
    }
}

fn enter(bench: &Workbench, ctx: &mut TestContext, phase: TestPhase) -> Result<()> {
    if let Some(timing) = ctx.advance(phase)? {
        bench.progress(timing.phase, ProgressData::PhaseFinished(timing));
    }
    debug!("Test '{}' entered {}", ctx.sequence_id(), phase);
    bench.progress(phase, ProgressData::PhaseEntered);
    Ok(())
}

async fn connect_required(bench: &mut Workbench, required: &[DeviceKind]) -> Result<()> {
    for &kind in required {
        bench.checkpoint()?;
        let device = bench.device(kind)?;
        device.connect().await?;
        if device.status() != DeviceStatus::Connected {
            return Err(EolError::NotConnected(format!(
                "{} is {} after connect",
                kind,
                device.status()
            )));
        }
    }
    Ok(())
}

async fn run_steps(bench: &mut Workbench, ctx: &mut TestContext, phase: &PhaseSpec) -> Result<()> {
    for step in &phase.steps {
        bench.checkpoint()?;
        run_step(bench, ctx, phase.phase, step).await?;
    }
    Ok(())
}

async fn run_step(
    bench: &mut Workbench,
    ctx: &mut TestContext,
    phase: TestPhase,
    step: &Step,
) -> Result<()> {
    match step {
        Step::Set {
            device,
            parameter,
            value,
        } => {
            bench
                .device(*device)?
                .set_parameter(*parameter, *value)
                .await
        }
        Step::Actuate { device, action } => bench.device(*device)?.actuate(*action).await,
        Step::Settle { ms } => {
            sleep(Duration::from_millis(*ms)).await;
            Ok(())
        }
        Step::Sample {
            device,
            channel,
            count,
            interval_ms,
            reduce: how,
        } => {
            let mut readings = Vec::with_capacity(*count as usize);
            for n in 0..*count {
                if n > 0 && *interval_ms > 0 {
                    sleep(Duration::from_millis(*interval_ms)).await;
                }
                readings.push(bench.device(*device)?.read_measurement(*channel).await?);
            }
            for reading in reduce(*how, readings) {
                let measurement = Measurement::record(*device, *channel, reading);
                bench.progress(phase, ProgressData::Measurement(measurement.clone()));
                ctx.record(measurement);
            }
            Ok(())
        }
        Step::WaitInput {
            device,
            input,
            level,
            poll_ms,
        } => {
            let poll = Duration::from_millis((*poll_ms).max(1));
            loop {
                let reading = bench
                    .device(*device)?
                    .read_measurement(Channel::Input(*input))
                    .await?;
                if (reading.value != 0.0) == *level {
                    return Ok(());
                }
                sleep(poll).await;
            }
        }
    }
}

/// Collapse repeated samples
pub fn reduce(how: Reduce, readings: Vec<Reading>) -> Vec<Reading> {
    match how {
        Reduce::Each => readings,
        Reduce::Peak => readings
            .into_iter()
            .max_by(|a, b| a.value.abs().total_cmp(&b.value.abs()))
            .into_iter()
            .collect(),
        Reduce::Mean => {
            let Some(first) = readings.first().copied() else {
                return Vec::new();
            };
            let mean = readings.iter().map(|r| r.value).sum::<f64>() / readings.len() as f64;
            let precision = readings.iter().map(|r| r.precision).max().unwrap_or(first.precision);
            vec![Reading::new(mean, first.unit, precision)]
        }
    }
}
