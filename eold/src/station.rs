//! Station wiring: configuration to a running engine, and test cycles
//!
//! The daemon builds every driver once from the station file, hands the
//! device table and sequence catalog to the engine, and then only talks to
//! the engine through submissions and events.

use anyhow::{bail, Context, Result};
use eol_core::{DriverMode, StationConfig};
use eol_engine::{
    DeviceTable, EngineEvent, ExecutionEngine, OperationOutput, ResultArchive, SequenceCatalog,
    TestResult,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Load the station file. With `force_mock` every device runs its mock twin.
pub fn load(path: &Path, force_mock: bool) -> Result<StationConfig> {
    let mut config = StationConfig::load(path)
        .with_context(|| format!("loading station config {}", path.display()))?;
    if force_mock {
        for device in &mut config.devices {
            device.mode = DriverMode::Mock;
        }
        info!("Mock mode: {} device(s) simulated", config.devices.len());
    }
    Ok(config)
}

/// Build the drivers and the catalog, then start the engine
pub fn start_engine(config: &StationConfig) -> Result<ExecutionEngine> {
    let devices = DeviceTable::from_configs(&config.devices)?;
    for device in &config.devices {
        info!(
            "  Device {}: {}{}",
            device.kind,
            if device.is_mock() { "mock" } else { "real" },
            device
                .transport
                .as_ref()
                .filter(|_| !device.is_mock())
                .map(|t| format!(" on {}", t.describe()))
                .unwrap_or_default()
        );
    }
    let catalog = SequenceCatalog::from_specs(config.sequences.iter().cloned())?;
    Ok(ExecutionEngine::start(devices, catalog)?)
}

/// Open the result archive: `override_dir` wins over the station file.
/// `None` when neither names a directory.
pub fn open_archive(
    config: &StationConfig,
    override_dir: Option<PathBuf>,
) -> Result<Option<ResultArchive>> {
    let Some(dir) = override_dir.or_else(|| config.engine.result_dir.clone()) else {
        info!("Result archive disabled");
        return Ok(None);
    };
    let archive = ResultArchive::open(&dir)
        .with_context(|| format!("opening result archive {}", dir.display()))?;
    Ok(Some(archive))
}

/// Serial number for cycle `n` of `repeat`
pub fn dut_for_cycle(dut: &str, n: u32, repeat: u32) -> String {
    if repeat > 1 {
        format!("{}-{:03}", dut, n + 1)
    } else {
        dut.to_string()
    }
}

/// Run `sequence` `repeat` times, one after another, pausing between
/// cycles. Each finished run is archived before the next one starts.
/// Stops at the first run that could not start or be archived.
pub async fn run_cycles(
    engine: &ExecutionEngine,
    archive: Option<&ResultArchive>,
    sequence: &str,
    dut: &str,
    repeat: u32,
    pause: Duration,
) -> Result<Vec<TestResult>> {
    let mut events = engine.subscribe();
    let mut results = Vec::with_capacity(repeat as usize);

    for n in 0..repeat {
        if n > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let serial = dut_for_cycle(dut, n, repeat);
        let id = engine.submit_test(sequence, serial.as_str())?;
        info!("Cycle {}/{}: {} on {} ({})", n + 1, repeat, sequence, serial, id);

        let result = wait_for_test(&mut events, id).await?;
        info!(
            "Cycle {}/{}: {} {:?}",
            n + 1,
            repeat,
            result.terminal,
            result.verdict
        );
        if let Some(archive) = archive {
            let path = archive
                .save(&result)
                .with_context(|| format!("archiving result for {}", serial))?;
            info!("Cycle {}/{}: archived to {}", n + 1, repeat, path.display());
        }
        results.push(result);
    }
    Ok(results)
}

async fn wait_for_test(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    id: eol_engine::OperationId,
) -> Result<TestResult> {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::OperationCompleted { id: done, output } if done == id => {
                return match output {
                    OperationOutput::Test(result) => Ok(*result),
                    OperationOutput::EmergencyStop(report) => {
                        warn!("{} interrupted by emergency stop", id);
                        bail!("emergency stop during test ({} device(s) tripped)", report.tripped.len())
                    }
                    other => bail!("unexpected output for {}: {:?}", id, other),
                };
            }
            EngineEvent::OperationFailed { id: failed, error } if failed == id => {
                bail!("{} failed: {}", id, error);
            }
            _ => {}
        }
    }
    bail!("engine stopped before {} finished", id)
}

/// One JSON line per event, for whoever reads the daemon's stdout
pub async fn print_events(mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Cannot serialize event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eol_core::{DeviceKind, TestPhase};
    use std::fs;
    use tempfile::TempDir;

    const STATION: &str = r#"
[engine]
cycle_pause_ms = 10

[[devices]]
kind = "load_cell"
mode = "mock"
[devices.mock]
base = 2.5
unit = "newton"

[[devices]]
kind = "power_supply"
[devices.transport]
kind = "tcp"
host = "127.0.0.1"
port = 1
[devices.mock]
base = 24.0

[[sequences]]
name = "force"
connect_timeout_ms = 1000
evaluate_timeout_ms = 1000

[[sequences.phases]]
phase = "executing"
timeout_ms = 1000
required = ["power_supply"]

[[sequences.phases.steps]]
step = "actuate"
device = "power_supply"
action = "output_on"

[[sequences.phases.steps]]
step = "sample"
device = "load_cell"
channel = "force"
count = 3
reduce = "peak"

[[sequences.limits]]
device = "load_cell"
unit = "newton"
min = 2.0
max = 3.0
"#;

    fn write_station(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("station.toml");
        fs::write(&path, STATION).unwrap();
        path
    }

    #[test]
    fn test_force_mock_overrides_real_devices() {
        let dir = TempDir::new().unwrap();
        let path = write_station(&dir);

        let real = load(&path, false).unwrap();
        assert!(!real.device(DeviceKind::PowerSupply).unwrap().is_mock());

        let mocked = load(&path, true).unwrap();
        assert!(mocked.devices.iter().all(|d| d.is_mock()));
        assert_eq!(mocked.engine.cycle_pause_ms, 10);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let err = load(&dir.path().join("absent.toml"), false).unwrap_err();
        assert!(format!("{:#}", err).contains("absent.toml"));
    }

    #[test]
    fn test_dut_serials() {
        assert_eq!(dut_for_cycle("SN", 0, 1), "SN");
        assert_eq!(dut_for_cycle("SN", 0, 3), "SN-001");
        assert_eq!(dut_for_cycle("SN", 2, 3), "SN-003");
    }

    #[tokio::test]
    async fn test_repeated_mock_cycles_pass() {
        let dir = TempDir::new().unwrap();
        let config = load(&write_station(&dir), true).unwrap();
        let engine = start_engine(&config).unwrap();

        let results = run_cycles(&engine, None, "force", "SN", 3, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        for (n, result) in results.iter().enumerate() {
            assert_eq!(result.terminal, TestPhase::Completed);
            assert!(result.passed(), "{:?}", result.verdict);
            assert_eq!(result.dut, format!("SN-{:03}", n + 1));
        }
        tokio_test::assert_ok!(engine.shutdown());
    }

    #[tokio::test]
    async fn test_each_cycle_is_archived() {
        let dir = TempDir::new().unwrap();
        let mut config = load(&write_station(&dir), true).unwrap();
        config.engine.result_dir = Some(dir.path().join("results"));
        let archive = open_archive(&config, None).unwrap().unwrap();
        let engine = start_engine(&config).unwrap();

        let results = run_cycles(&engine, Some(&archive), "force", "SN", 2, Duration::ZERO)
            .await
            .unwrap();

        let files = archive.entries().unwrap();
        assert_eq!(files.len(), results.len());
        for (file, result) in files.iter().zip(&results) {
            let value: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap();
            assert_eq!(value["dut"], result.dut.as_str());
            assert_eq!(value["verdict"]["verdict"], "pass");
            assert_eq!(value["measurements"].as_array().unwrap().len(), 1);
        }
        tokio_test::assert_ok!(engine.shutdown());
    }

    #[test]
    fn test_archive_dir_override() {
        let dir = TempDir::new().unwrap();
        let config = load(&write_station(&dir), true).unwrap();
        assert!(open_archive(&config, None).unwrap().is_none());

        let archive = open_archive(&config, Some(dir.path().join("out")))
            .unwrap()
            .unwrap();
        assert_eq!(archive.dir(), dir.path().join("out"));
        assert!(archive.dir().is_dir());
    }

    #[tokio::test]
    async fn test_unknown_sequence_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = load(&write_station(&dir), true).unwrap();
        let engine = start_engine(&config).unwrap();

        let err = run_cycles(&engine, None, "torque", "SN", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("torque"));
    }
}
