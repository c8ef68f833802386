//! Power analyzer drivers: Yokogawa WT1800E over TCP SCPI, and its mock
//!
//! The analyzer only measures. Its numeric list is configured at connect
//! so that the first three items are voltage, current and active power of
//! the configured input element.

use super::mock::MockCore;
use super::{unsupported, CommandPolicy, DeviceHandle, Instrument, MockProbe};
use crate::codec::scpi::{self, WtCommand};
use crate::transport::{self, Backoff, CommandSession, ScpiOptions, TcpCommandTransport, Transport};
use async_trait::async_trait;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, ErrorRecord, Parameter, Reading,
    Result, Unit,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub struct Wt1800eAnalyzer {
    transport: TcpCommandTransport,
    backoff: Backoff,
    policy: CommandPolicy,
    handle: DeviceHandle<CommandSession<TcpStream>>,
    element: u8,
    faults: Vec<String>,
}

/// One `:NUMeric` read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl PowerReading {
    fn channel(&self, channel: Channel) -> Option<Reading> {
        match channel {
            Channel::Voltage => Some(Reading::new(self.voltage, Unit::Volt, 4)),
            Channel::Current => Some(Reading::new(self.current, Unit::Ampere, 4)),
            Channel::Power => Some(Reading::new(self.power, Unit::Watt, 4)),
            _ => None,
        }
    }
}

impl Wt1800eAnalyzer {
    pub fn new(host: &str, port: u16, config: &DeviceConfig) -> Self {
        let policy = CommandPolicy::from(&config.retry);
        let options = ScpiOptions {
            remote_lock: Some(scpi::WT_REMOTE_ON.to_string()),
            error_query: Some(scpi::WT_ERROR_QUERY.to_string()),
            ..ScpiOptions::default()
        };
        let transport = TcpCommandTransport::new(host, port, options).io_timeout(policy.timeout);
        Self {
            handle: DeviceHandle::new(format!("power analyzer {}", transport.target())),
            transport,
            backoff: Backoff::from(&config.retry),
            policy,
            element: config.options.element,
            faults: Vec::new(),
        }
    }

    pub fn faults(&self) -> &[String] {
        &self.faults
    }

    /// Read U, I, P, falling back to the legacy query form
    pub async fn read_power(&mut self) -> Result<PowerReading> {
        let (reading, faults) = self
            .handle
            .call(&self.policy, |session| {
                Box::pin(async move {
                    let values = read_numeric(session).await?;
                    session.end_batch().await?;
                    Ok((
                        PowerReading {
                            voltage: values[0],
                            current: values[1],
                            power: values[2],
                        },
                        session.take_faults(),
                    ))
                })
            })
            .await?;
        self.record_faults(faults);
        Ok(reading)
    }

    async fn send_batch(&mut self, command: WtCommand) -> Result<()> {
        let lines = command.encode();
        let faults = self
            .handle
            .call(&self.policy, move |session| {
                let lines = lines.clone();
                Box::pin(async move {
                    for line in &lines {
                        session.write(line).await?;
                    }
                    session.end_batch().await?;
                    Ok(session.take_faults())
                })
            })
            .await?;
        self.record_faults(faults);
        Ok(())
    }

    fn record_faults(&mut self, faults: Vec<String>) {
        if !faults.is_empty() {
            warn!("WT1800E reported {} error(s)", faults.len());
            self.faults.extend(faults);
        }
    }
}

async fn read_numeric(session: &mut CommandSession<TcpStream>) -> Result<Vec<f64>> {
    let primary = WtCommand::ReadNumeric.encode();
    let text = session.query(&primary[0]).await?;
    match scpi::decode_values(&text, 3) {
        Ok(values) => Ok(values),
        Err(e) => {
            debug!("Numeric read failed ({}), trying legacy query", e);
            let legacy = WtCommand::ReadNumericLegacy.encode();
            scpi::decode_values(&session.query(&legacy[0]).await?, 3)
        }
    }
}

#[async_trait]
impl Instrument for Wt1800eAnalyzer {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PowerAnalyzer
    }

    fn model(&self) -> &'static str {
        "WT1800E"
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
                info!("Power analyzer: {} {}", identity.manufacturer, identity.model);
                Ok(session)
            })
            .await?;
        self.send_batch(WtCommand::ConfigureNumeric {
            element: self.element,
        })
        .await
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.handle.is_connected() {
            let released = self
                .handle
                .call(&self.policy, |session| {
                    Box::pin(async move { session.write(scpi::WT_REMOTE_OFF).await })
                })
                .await;
            if let Err(e) = released {
                debug!("Remote release failed: {}", e);
            }
        }
        self.handle.disconnect().await;
        Ok(())
    }

    async fn read_measurement(&mut self, channel: Channel) -> Result<Reading> {
        if !matches!(channel, Channel::Voltage | Channel::Current | Channel::Power) {
            return Err(unsupported(self.kind(), format!("channel {:?}", channel)));
        }
        let reading = self.read_power().await?;
        reading
            .channel(channel)
            .ok_or_else(|| unsupported(DeviceKind::PowerAnalyzer, format!("channel {:?}", channel)))
    }

    async fn set_parameter(&mut self, parameter: Parameter, _value: f64) -> Result<()> {
        Err(unsupported(self.kind(), format!("parameter {:?}", parameter)))
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        let command = match action {
            Action::IntegrationStart => WtCommand::IntegrationStart,
            Action::IntegrationStop => WtCommand::IntegrationStop,
            Action::IntegrationReset => WtCommand::IntegrationReset,
            other => return Err(unsupported(self.kind(), format!("{:?}", other))),
        };
        self.send_batch(command).await
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        debug!("power analyzer has no outputs to stop");
        Ok(())
    }
}

/// Mock analyzer. Setting a voltage or current simulates the source
/// under test; readings follow it within the configured noise.
pub struct MockPowerAnalyzer {
    core: MockCore,
    voltage: f64,
    current: f64,
    integrating: bool,
}

impl MockPowerAnalyzer {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            voltage: config.mock.base,
            current: config.mock.base_secondary,
            core: MockCore::new(config),
            integrating: false,
        }
    }

    pub fn probe(&self) -> MockProbe {
        self.core.probe()
    }

    pub fn integrating(&self) -> bool {
        self.integrating
    }
}

#[async_trait]
impl Instrument for MockPowerAnalyzer {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PowerAnalyzer
    }

    fn model(&self) -> &'static str {
        "mock power analyzer"
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
        let (base, unit) = match channel {
            Channel::Voltage => (self.voltage, Unit::Volt),
            Channel::Current => (self.current, Unit::Ampere),
            Channel::Power => (self.voltage * self.current, Unit::Watt),
            other => return Err(unsupported(self.kind(), format!("channel {:?}", other))),
        };
        self.core.sample(base, unit, 4).await
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
            Action::IntegrationStart => self.integrating = true,
            Action::IntegrationStop => self.integrating = false,
            Action::IntegrationReset => {}
            other => return Err(unsupported(self.kind(), format!("{:?}", other))),
        }
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        self.core.probe().count_emergency_stop();
        Ok(())
    }

    async fn make_safe(&mut self) -> Result<()> {
        self.core.probe().count_make_safe();
        self.integrating = false;
        Ok(())
    }
}
