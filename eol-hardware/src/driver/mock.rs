//! Shared plumbing for mock drivers
//!
//! Mocks keep the same state machine as real drivers (status, last error,
//! NotConnected outside Connected) and produce `base ± noise` readings.

use super::{ConnectGuard, EmergencyStop};
use eol_core::{
    DeviceConfig, DeviceKind, DeviceStatus, EolError, ErrorRecord, MockConfig, Reading, Result,
    Unit,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU32,
    disconnects: AtomicU32,
    reads: AtomicU32,
    commands: AtomicU32,
    make_safe: AtomicU32,
    emergency_stops: AtomicU32,
}

/// Call counters shared between a mock and the test that built it
#[derive(Debug, Clone, Default)]
pub struct MockProbe(Arc<Counters>);

impl MockProbe {
    pub fn connects(&self) -> u32 {
        self.0.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.0.disconnects.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> u32 {
        self.0.reads.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> u32 {
        self.0.commands.load(Ordering::SeqCst)
    }

    pub fn make_safe_calls(&self) -> u32 {
        self.0.make_safe.load(Ordering::SeqCst)
    }

    pub fn emergency_stops(&self) -> u32 {
        self.0.emergency_stops.load(Ordering::SeqCst)
    }

    pub(crate) fn count_make_safe(&self) {
        self.0.make_safe.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_emergency_stop(&self) {
        self.0.emergency_stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Bounded uniform noise, reproducible when seeded
pub struct Noise {
    rng: StdRng,
    bound: f64,
}

impl Noise {
    pub fn new(bound: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            bound: bound.abs(),
        }
    }

    /// `base` plus a value in `[-bound, bound]`
    pub fn apply(&mut self, base: f64) -> f64 {
        if self.bound == 0.0 {
            return base;
        }
        base + self.rng.gen_range(-self.bound..=self.bound)
    }
}

/// State every mock driver carries
pub struct MockCore {
    kind: DeviceKind,
    status: DeviceStatus,
    last_error: Option<ErrorRecord>,
    config: MockConfig,
    noise: Noise,
    probe: MockProbe,
}

impl MockCore {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            kind: config.kind,
            status: DeviceStatus::Disconnected,
            last_error: None,
            noise: Noise::new(config.mock.noise, config.mock.seed),
            config: config.mock.clone(),
            probe: MockProbe::default(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.clone()
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    /// Reported unit, falling back to the family default
    pub fn unit_or(&self, default: Unit) -> Unit {
        self.config.unit.unwrap_or(default)
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.status == DeviceStatus::Connected {
            return Ok(());
        }
        self.status = DeviceStatus::Connecting;
        let label = format!("mock {}", self.kind);
        let mut guard = ConnectGuard::arm(&label, &mut self.status, &mut self.last_error);
        sleep(Duration::from_millis(self.config.connect_delay_ms)).await;
        guard.disarm();
        drop(guard);

        if self.config.fail_connect {
            let err = EolError::ConnectionFailed {
                target: format!("mock {}", self.kind),
                attempts: 1,
                reason: "injected connect failure".to_string(),
            };
            self.status = DeviceStatus::Faulted;
            self.last_error = Some(err.to_record());
            return Err(err);
        }

        self.probe.0.connects.fetch_add(1, Ordering::SeqCst);
        self.status = DeviceStatus::Connected;
        self.last_error = None;
        debug!("mock {} connected", self.kind);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.status != DeviceStatus::Disconnected {
            self.probe.0.disconnects.fetch_add(1, Ordering::SeqCst);
            debug!("mock {} disconnected", self.kind);
        }
        self.status = DeviceStatus::Disconnected;
    }

    /// Gate for every command: must be connected, then simulated latency
    pub async fn command(&mut self) -> Result<()> {
        if self.status != DeviceStatus::Connected {
            return Err(EolError::NotConnected(format!(
                "mock {} is {}",
                self.kind, self.status
            )));
        }
        self.probe.0.commands.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(self.config.command_delay_ms)).await;
        Ok(())
    }

    /// One noisy sample around `base`
    pub async fn sample(&mut self, base: f64, unit: Unit, precision: u8) -> Result<Reading> {
        self.command().await?;
        self.probe.0.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Reading::new(self.noise.apply(base), unit, precision))
    }
}

/// Out-of-band stopper for mocks: counts trips
pub struct ProbeStopper {
    pub kind: DeviceKind,
    pub probe: MockProbe,
}

impl EmergencyStop for ProbeStopper {
    fn device(&self) -> DeviceKind {
        self.kind
    }

    fn trip(&self) -> Result<()> {
        self.probe.count_emergency_stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_stays_in_bounds() {
        let mut noise = Noise::new(0.05, None);
        for _ in 0..1000 {
            let v = noise.apply(24.0);
            assert!((23.95..=24.05).contains(&v));
        }
    }

    #[test]
    fn test_seeded_noise_repeats() {
        let mut a = Noise::new(1.0, Some(42));
        let mut b = Noise::new(1.0, Some(42));
        for _ in 0..10 {
            assert_eq!(a.apply(0.0), b.apply(0.0));
        }
    }

    #[tokio::test]
    async fn test_command_requires_connection() {
        let mut core = MockCore::new(&DeviceConfig::mock(DeviceKind::LoadCell));
        assert!(matches!(
            core.command().await,
            Err(EolError::NotConnected(_))
        ));
        core.connect().await.unwrap();
        core.connect().await.unwrap();
        assert_eq!(core.probe().connects(), 1);
        core.command().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_connect_leaves_faulted() {
        let mut config = DeviceConfig::mock(DeviceKind::LoadCell);
        config.mock.connect_delay_ms = 300;
        let mut core = MockCore::new(&config);

        let cut = tokio::time::timeout(Duration::from_millis(20), core.connect()).await;
        assert!(cut.is_err());

        assert_eq!(core.status(), DeviceStatus::Faulted);
        assert!(core.last_error().is_some());
        assert_eq!(core.probe().connects(), 0);
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let mut config = DeviceConfig::mock(DeviceKind::Mcu);
        config.mock.fail_connect = true;
        let mut core = MockCore::new(&config);

        let err = core.connect().await.unwrap_err();
        assert!(matches!(err, EolError::ConnectionFailed { .. }));
        assert_eq!(core.status(), DeviceStatus::Faulted);
        assert_eq!(core.last_error().unwrap().code, 202);
    }
}
