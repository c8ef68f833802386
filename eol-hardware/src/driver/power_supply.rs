//! Power supply drivers: ODA programmable supply over TCP SCPI, and its mock

use super::mock::MockCore;
use super::{unsupported, CommandPolicy, DeviceHandle, EmergencyStop, Instrument, MockProbe};
use crate::codec::scpi::{self, OdaCommand};
use crate::transport::{self, Backoff, CommandSession, ScpiOptions, TcpCommandTransport, Transport};
use async_trait::async_trait;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, EolError, ErrorRecord, Parameter,
    Reading, Result, Unit,
};
use std::io::Write;
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub struct OdaPowerSupply {
    transport: TcpCommandTransport,
    backoff: Backoff,
    policy: CommandPolicy,
    handle: DeviceHandle<CommandSession<TcpStream>>,
    stabilization: Duration,
    stopper: Arc<OdaStopper>,
    faults: Vec<String>,
}

impl OdaPowerSupply {
    pub fn new(host: &str, port: u16, config: &DeviceConfig) -> Self {
        let policy = CommandPolicy::from(&config.retry);
        let transport =
            TcpCommandTransport::new(host, port, ScpiOptions::default()).io_timeout(policy.timeout);
        Self {
            handle: DeviceHandle::new(format!("power supply {}", transport.target())),
            stopper: Arc::new(OdaStopper {
                host: host.to_string(),
                port,
                timeout: policy.timeout,
            }),
            transport,
            backoff: Backoff::from(&config.retry),
            policy,
            stabilization: Duration::from_millis(config.options.stabilization_ms),
            faults: Vec::new(),
        }
    }

    /// Error-queue entries collected from the instrument so far
    pub fn faults(&self) -> &[String] {
        &self.faults
    }

    /// Send one command batch, then drain the instrument error queue
    async fn batch(&mut self, command: OdaCommand) -> Result<Vec<f64>> {
        let line = command.encode();
        let expected = command.response_values();

        let (values, faults) = self
            .handle
            .call(&self.policy, move |session| {
                let line = line.clone();
                Box::pin(async move {
                    let values = if expected > 0 {
                        scpi::decode_values(&session.query(&line).await?, expected)?
                    } else {
                        session.write(&line).await?;
                        Vec::new()
                    };
                    session.end_batch().await?;
                    Ok((values, session.take_faults()))
                })
            })
            .await?;

        if !faults.is_empty() {
            warn!("ODA reported {} error(s) after '{}'", faults.len(), command.encode());
            self.faults.extend(faults);
        }
        Ok(values)
    }

    async fn settle(&self) {
        if !self.stabilization.is_zero() {
            debug!("Waiting {:?} for output to stabilize", self.stabilization);
            sleep(self.stabilization).await;
        }
    }
}

#[async_trait]
impl Instrument for OdaPowerSupply {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PowerSupply
    }

    fn model(&self) -> &'static str {
        "ODA"
    }

    fn status(&self) -> DeviceStatus {
        self.handle.status()
    }

    fn last_error(&self) -> Option<ErrorRecord> {
        self.handle.last_error()
    }

    async fn connect(&mut self) -> Result<()> {
        let transport = &self.transport;
        let backoff = &self.backoff;
        self.handle
            .connect_with(|| async move {
                let mut session = transport::connect(transport, backoff).await?;
                let identity = scpi::decode_identity(&session.query(scpi::IDN_QUERY).await?)?;
                info!(
                    "Power supply: {} {} (fw {})",
                    identity.manufacturer, identity.model, identity.firmware
                );
                session.write(scpi::CLEAR_STATUS).await?;
                Ok(session)
            })
            .await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.handle.disconnect().await;
        Ok(())
    }

    async fn read_measurement(&mut self, channel: Channel) -> Result<Reading> {
        match channel {
            Channel::Voltage => {
                let v = self.batch(OdaCommand::MeasureVoltage).await?;
                Ok(Reading::new(v[0], Unit::Volt, 3))
            }
            Channel::Current => {
                let c = self.batch(OdaCommand::MeasureCurrent).await?;
                Ok(Reading::new(c[0], Unit::Ampere, 3))
            }
            Channel::Power => {
                let all = self.batch(OdaCommand::MeasureAll).await?;
                Ok(Reading::new(all[0] * all[1], Unit::Watt, 3))
            }
            other => Err(unsupported(self.kind(), format!("channel {:?}", other))),
        }
    }

    async fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        if value < 0.0 {
            return Err(EolError::InvalidInput(format!(
                "{:?} setpoint {} is negative",
                parameter, value
            )));
        }
        let command = match parameter {
            Parameter::Voltage => OdaCommand::SetVoltage(value),
            Parameter::Current => OdaCommand::SetCurrent(value),
            other => return Err(unsupported(self.kind(), format!("parameter {:?}", other))),
        };
        self.batch(command).await?;
        self.settle().await;
        Ok(())
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        let command = match action {
            Action::OutputOn => OdaCommand::Output(true),
            Action::OutputOff => OdaCommand::Output(false),
            other => return Err(unsupported(self.kind(), format!("{:?}", other))),
        };
        self.batch(command).await?;
        if action == Action::OutputOn {
            self.settle().await;
        }
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        if self.handle.is_connected() && self.batch(OdaCommand::Output(false)).await.is_ok() {
            return Ok(());
        }
        self.stopper.trip()
    }

    async fn make_safe(&mut self) -> Result<()> {
        if !self.handle.is_connected() {
            return Ok(());
        }
        self.batch(OdaCommand::Output(false)).await.map(|_| ())
    }

    fn emergency_stopper(&self) -> Option<Arc<dyn EmergencyStop>> {
        Some(self.stopper.clone())
    }
}

/// Turns the output off over a fresh blocking connection
pub struct OdaStopper {
    host: String,
    port: u16,
    timeout: Duration,
}

impl EmergencyStop for OdaStopper {
    fn device(&self) -> DeviceKind {
        DeviceKind::PowerSupply
    }

    fn trip(&self) -> Result<()> {
        let target = format!("{}:{}", self.host, self.port);
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EolError::Network(format!("cannot resolve {}", target)))?;

        let mut stream = StdTcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| EolError::Network(format!("emergency stop to {}: {}", target, e)))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(format!("{}\n", OdaCommand::Output(false).encode()).as_bytes())?;
        stream.flush()?;
        warn!("Power supply {} output forced off", target);
        Ok(())
    }
}

/// Mock supply: reads the setpoints while the output is on, zero otherwise
pub struct MockPowerSupply {
    core: MockCore,
    voltage: f64,
    current: f64,
    output: Arc<AtomicBool>,
}

impl MockPowerSupply {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            voltage: config.mock.base,
            current: config.mock.base_secondary,
            core: MockCore::new(config),
            output: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn probe(&self) -> MockProbe {
        self.core.probe()
    }

    pub fn output_enabled(&self) -> bool {
        self.output.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Instrument for MockPowerSupply {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PowerSupply
    }

    fn model(&self) -> &'static str {
        "mock power supply"
    }

    fn status(&self) -> DeviceStatus {
        self.core.status()
    }

    fn last_error(&self) -> Option<ErrorRecord> {
        self.core.last_error()
    }

    async fn connect(&mut self) -> Result<()> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.core.disconnect();
        Ok(())
    }

    async fn read_measurement(&mut self, channel: Channel) -> Result<Reading> {
        let on = self.output_enabled();
        let level = |v: f64| if on { v } else { 0.0 };
        match channel {
            Channel::Voltage => {
                let unit = self.core.unit_or(Unit::Volt);
                self.core.sample(level(self.voltage), unit, 3).await
            }
            Channel::Current => self.core.sample(level(self.current), Unit::Ampere, 3).await,
            Channel::Power => {
                self.core
                    .sample(level(self.voltage * self.current), Unit::Watt, 3)
                    .await
            }
            other => Err(unsupported(self.kind(), format!("channel {:?}", other))),
        }
    }

    async fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        self.core.command().await?;
        match parameter {
            Parameter::Voltage => self.voltage = value,
            Parameter::Current => self.current = value,
            other => return Err(unsupported(self.kind(), format!("parameter {:?}", other))),
        }
        Ok(())
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        self.core.command().await?;
        match action {
            Action::OutputOn => self.output.store(true, Ordering::SeqCst),
            Action::OutputOff => self.output.store(false, Ordering::SeqCst),
            other => return Err(unsupported(self.kind(), format!("{:?}", other))),
        }
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        self.core.probe().count_emergency_stop();
        self.output.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn make_safe(&mut self) -> Result<()> {
        self.core.probe().count_make_safe();
        self.output.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn emergency_stopper(&self) -> Option<Arc<dyn EmergencyStop>> {
        Some(Arc::new(MockSupplyStopper {
            output: self.output.clone(),
            probe: self.core.probe(),
        }))
    }
}

struct MockSupplyStopper {
    output: Arc<AtomicBool>,
    probe: MockProbe,
}

impl EmergencyStop for MockSupplyStopper {
    fn device(&self) -> DeviceKind {
        DeviceKind::PowerSupply
    }

    fn trip(&self) -> Result<()> {
        self.output.store(false, Ordering::SeqCst);
        self.probe.count_emergency_stop();
        Ok(())
    }
}
