//! Device drivers
//!
//! One driver per device family, each composing a transport session with
//! its codec behind the [`Instrument`] capability interface. Every family
//! has a mock twin with the same interface; [`build_driver`] resolves the
//! concrete driver once from configuration.
//!
//! Drivers are the only layer that retries: [`DeviceHandle::call`] repeats
//! a command on Transient errors with a fixed delay and returns Protocol
//! and Fatal errors immediately.

pub mod digital_io;
pub mod loadcell;
pub mod mcu;
pub mod mock;
pub mod motion;
pub mod power_analyzer;
pub mod power_supply;

use crate::transport::{AxlLibrary, Session};
use async_trait::async_trait;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, DriverMode, EolError, ErrorRecord,
    Parameter, Reading, Result, RetryConfig, TransportConfig,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use digital_io::{AxlDigitalIo, MockDigitalIo};
pub use loadcell::{Bs205LoadCell, MockLoadCell};
pub use mcu::{LmaMcu, MockMcu};
pub use mock::MockProbe;
pub use motion::{AxlMotion, MockMotion};
pub use power_analyzer::{MockPowerAnalyzer, Wt1800eAnalyzer};
pub use power_supply::{MockPowerSupply, OdaPowerSupply};

/// Capability interface shared by every device driver, real or mock.
///
/// Only the execution engine's worker calls these methods, so drivers own
/// their state without locking.
#[async_trait]
pub trait Instrument: Send {
    fn kind(&self) -> DeviceKind;

    /// Vendor model, or the mock family name
    fn model(&self) -> &'static str;

    fn status(&self) -> DeviceStatus;

    fn last_error(&self) -> Option<ErrorRecord>;

    /// Open the session. A no-op when already connected; from Faulted
    /// this is the explicit reconnect.
    async fn connect(&mut self) -> Result<()>;

    /// Close the session. Succeeds without effect when already
    /// disconnected.
    async fn disconnect(&mut self) -> Result<()>;

    async fn read_measurement(&mut self, channel: Channel) -> Result<Reading>;

    async fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()>;

    async fn actuate(&mut self, action: Action) -> Result<()>;

    /// In-band emergency stop through the driver's own session
    async fn emergency_stop(&mut self) -> Result<()>;

    /// Put outputs and actuators into a safe state. Runs during test
    /// cleanup, so it must tolerate a device that never connected.
    async fn make_safe(&mut self) -> Result<()> {
        Ok(())
    }

    /// Out-of-band stopper usable from any thread while the worker is busy
    fn emergency_stopper(&self) -> Option<Arc<dyn EmergencyStop>> {
        None
    }
}

/// Synchronous, best-effort emergency stop that bypasses the operation
/// queue.
pub trait EmergencyStop: Send + Sync {
    fn device(&self) -> DeviceKind;

    fn trip(&self) -> Result<()>;
}

/// Something a [`DeviceHandle`] holds open and must release
#[async_trait]
pub trait Connection: Send {
    async fn close(&mut self);
}

#[async_trait]
impl<S: Session> Connection for S {
    async fn close(&mut self) {
        Session::close(self).await
    }
}

/// An opened AXL library: the native transport has no byte session
pub struct AxlLink {
    pub library: Arc<AxlLibrary>,
}

#[async_trait]
impl Connection for AxlLink {
    async fn close(&mut self) {
        // motion and DIO share the library; only the last user closes it
        if Arc::strong_count(&self.library) == 1 {
            if let Err(e) = self.library.close() {
                debug!("AxlClose: {}", e);
            }
        }
    }
}

/// Boxed future returned by [`DeviceHandle::call`] closures
pub type CallFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Per-command timeout and retry policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl From<&RetryConfig> for CommandPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            timeout: config.command_timeout(),
            retries: config.command_retries,
            retry_delay: config.command_retry_delay(),
        }
    }
}

/// Connection state for one device, owned by its driver
pub struct DeviceHandle<C> {
    label: String,
    status: DeviceStatus,
    last_error: Option<ErrorRecord>,
    connection: Option<C>,
}

impl<C: Connection> DeviceHandle<C> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: DeviceStatus::Disconnected,
            last_error: None,
            connection: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status == DeviceStatus::Connected
    }

    /// Drive Disconnected/Faulted → Connecting → Connected with `open`.
    /// Any failure leaves the handle Faulted.
    pub async fn connect_with<F, Fut>(&mut self, open: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<C>> + Send,
    {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(mut stale) = self.connection.take() {
            stale.close().await;
        }

        debug!("{}: {} -> connecting", self.label, self.status);
        self.status = DeviceStatus::Connecting;
        let result = {
            let mut guard =
                ConnectGuard::arm(&self.label, &mut self.status, &mut self.last_error);
            let result = open().await;
            guard.disarm();
            result
        };
        match result {
            Ok(connection) => {
                self.connection = Some(connection);
                self.status = DeviceStatus::Connected;
                self.last_error = None;
                info!("{} connected", self.label);
                Ok(())
            }
            Err(e) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
            info!("{} disconnected", self.label);
        }
        self.status = DeviceStatus::Disconnected;
    }

    /// Move to Faulted; only a reconnect leaves this state
    pub fn fault(&mut self, error: &EolError) {
        warn!("{} faulted: {}", self.label, error);
        self.status = DeviceStatus::Faulted;
        self.last_error = Some(error.to_record());
    }

    pub fn connection(&mut self) -> Result<&mut C> {
        if !self.is_connected() {
            return Err(EolError::NotConnected(format!(
                "{} is {}",
                self.label, self.status
            )));
        }
        self.connection
            .as_mut()
            .ok_or_else(|| EolError::NotConnected(self.label.clone()))
    }

    /// Run one command exchange under `policy`.
    ///
    /// `exchange` is called again for every retry, so it must rebuild its
    /// frame from owned data. Transient errors are retried; a Transient
    /// error that outlives the retries, or a Fatal one, faults the handle.
    pub async fn call<T, F>(&mut self, policy: &CommandPolicy, mut exchange: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut C) -> CallFuture<'a, T> + Send,
    {
        let attempts = policy.retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let connection = self.connection()?;
                exchange(connection).await
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "{}: {} (attempt {}/{}), retrying in {:?}",
                        self.label, e, attempt, attempts, policy.retry_delay
                    );
                    sleep(policy.retry_delay).await;
                }
                Err(e) => {
                    if e.faults_device() {
                        self.fault(&e);
                    } else {
                        self.last_error = Some(e.to_record());
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Leaves a device Faulted when its connect future is dropped before it
/// settles (a phase timeout or a cancel). Without it the device would stay
/// Connecting with no error recorded.
pub(crate) struct ConnectGuard<'a> {
    label: &'a str,
    status: &'a mut DeviceStatus,
    last_error: &'a mut Option<ErrorRecord>,
    armed: bool,
}

impl<'a> ConnectGuard<'a> {
    pub(crate) fn arm(
        label: &'a str,
        status: &'a mut DeviceStatus,
        last_error: &'a mut Option<ErrorRecord>,
    ) -> Self {
        Self {
            label,
            status,
            last_error,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let error = EolError::Timeout(format!(
            "connect to {} abandoned before it finished",
            self.label
        ));
        warn!("{} faulted: {}", self.label, error);
        *self.status = DeviceStatus::Faulted;
        *self.last_error = Some(error.to_record());
    }
}

pub(crate) fn unsupported(kind: DeviceKind, what: impl std::fmt::Display) -> EolError {
    EolError::Unsupported(format!("{} does not support {}", kind, what))
}

/// Construct the driver for `config`. Resolved once; the configuration is
/// not consulted again.
pub fn build_driver(config: &DeviceConfig) -> Result<Box<dyn Instrument>> {
    use DeviceKind::*;

    if config.mode == DriverMode::Mock {
        return Ok(match config.kind {
            Motion => Box::new(MockMotion::new(config)),
            Mcu => Box::new(MockMcu::new(config)),
            LoadCell => Box::new(MockLoadCell::new(config)),
            PowerSupply => Box::new(MockPowerSupply::new(config)),
            DigitalIo => Box::new(MockDigitalIo::new(config)),
            PowerAnalyzer => Box::new(MockPowerAnalyzer::new(config)),
        });
    }

    let transport = config
        .transport
        .as_ref()
        .ok_or_else(|| EolError::Config(format!("device '{}' has no transport", config.kind)))?;

    let driver: Box<dyn Instrument> = match (config.kind, transport) {
        (LoadCell, TransportConfig::Serial { port, baud_rate }) => {
            Box::new(Bs205LoadCell::serial(port, *baud_rate, config))
        }
        (Mcu, TransportConfig::Serial { port, baud_rate }) => {
            Box::new(LmaMcu::serial(port, *baud_rate, config))
        }
        (PowerSupply, TransportConfig::Tcp { host, port }) => {
            Box::new(OdaPowerSupply::new(host, *port, config))
        }
        (PowerAnalyzer, TransportConfig::Tcp { host, port }) => {
            Box::new(Wt1800eAnalyzer::new(host, *port, config))
        }
        (Motion, TransportConfig::Native { library, irq }) => {
            Box::new(AxlMotion::new(library, *irq, config))
        }
        (DigitalIo, TransportConfig::Native { library, irq }) => {
            Box::new(AxlDigitalIo::new(library, *irq, config))
        }
        (kind, transport) => {
            return Err(EolError::Config(format!(
                "device '{}' cannot use transport {}",
                kind,
                transport.describe()
            )))
        }
    };
    debug!(
        "Built {} driver {} on {}",
        config.kind,
        driver.model(),
        transport.describe()
    );
    Ok(driver)
}
