//! Load cell drivers: BS205 indicator over serial, and its mock

use super::mock::MockCore;
use super::{unsupported, CommandPolicy, DeviceHandle, Instrument};
use crate::codec::bs205::{self, Bs205Command};
use crate::codec::ResponseFrame;
use crate::transport::{self, Backoff, Framing, SerialTransport, Session, Transport};
use async_trait::async_trait;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, EolError, ErrorRecord, Parameter,
    Reading, Result, Unit,
};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

/// BS205 weight indicator
pub struct Bs205LoadCell<T: Transport = SerialTransport> {
    transport: T,
    backoff: Backoff,
    policy: CommandPolicy,
    handle: DeviceHandle<T::Session>,
    indicator_id: u8,
    min_interval: Duration,
    zero_settle: Duration,
    last_command: Option<Instant>,
}

/// Response framing: everything up to and including ETX
pub fn framing() -> Framing {
    Framing::Terminator(vec![bs205::ETX])
}

impl Bs205LoadCell<SerialTransport> {
    pub fn serial(port: &str, baud_rate: u32, config: &DeviceConfig) -> Self {
        let transport = SerialTransport::new(port, baud_rate, framing()).clear_on_send(true);
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> Bs205LoadCell<T> {
    pub fn with_transport(transport: T, config: &DeviceConfig) -> Self {
        let handle = DeviceHandle::new(format!("load cell {}", transport.target()));
        Self {
            transport,
            backoff: Backoff::from(&config.retry),
            policy: CommandPolicy::from(&config.retry),
            handle,
            indicator_id: config.options.indicator_id,
            min_interval: Duration::from_millis(config.options.min_command_interval_ms),
            zero_settle: Duration::from_millis(config.options.zero_settle_ms),
            last_command: None,
        }
    }

    /// The indicator drops commands sent closer together than its minimum
    /// interval
    async fn pace(&mut self) {
        if let Some(last) = self.last_command {
            sleep_until(last + self.min_interval).await;
        }
    }

    async fn execute(&mut self, command: Bs205Command) -> Result<Option<Reading>> {
        let frame = bs205::encode(self.indicator_id, command)?;
        let expected_id = self.indicator_id;
        let timeout = self.policy.timeout;

        self.pace().await;
        let result = self
            .handle
            .call(&self.policy, move |session| {
                let frame = frame.clone();
                Box::pin(async move {
                    session.send(frame.as_bytes()).await?;
                    if !command.expects_response() {
                        return Ok(None);
                    }
                    let raw = session.receive(timeout).await?;
                    let weight = bs205::decode(&ResponseFrame::from(raw))?;
                    if weight.indicator_id != expected_id {
                        return Err(EolError::Protocol(format!(
                            "answer from indicator {}, expected {}",
                            weight.indicator_id, expected_id
                        )));
                    }
                    Ok(Some(weight.reading))
                })
            })
            .await;
        self.last_command = Some(Instant::now());
        result
    }
}

#[async_trait]
impl<T> Instrument for Bs205LoadCell<T>
where
    T: Transport + 'static,
{
    fn kind(&self) -> DeviceKind {
        DeviceKind::LoadCell
    }

    fn model(&self) -> &'static str {
        "BS205"
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
            .connect_with(|| transport::connect(transport, backoff))
            .await?;
        self.last_command = None;
        info!("BS205 indicator {} ready", self.indicator_id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.handle.disconnect().await;
        Ok(())
    }

    async fn read_measurement(&mut self, channel: Channel) -> Result<Reading> {
        if channel != Channel::Force {
            return Err(unsupported(self.kind(), format!("channel {:?}", channel)));
        }
        self.execute(Bs205Command::ReadWeight)
            .await?
            .ok_or_else(|| EolError::Protocol("weight read returned no frame".to_string()))
    }

    async fn set_parameter(&mut self, parameter: Parameter, _value: f64) -> Result<()> {
        Err(unsupported(self.kind(), format!("parameter {:?}", parameter)))
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        let command = match action {
            Action::Zero => Bs205Command::Zero,
            Action::Hold => Bs205Command::Hold,
            Action::HoldRelease => Bs205Command::HoldRelease,
            other => return Err(unsupported(self.kind(), format!("{:?}", other))),
        };
        self.execute(command).await?;
        if command == Bs205Command::Zero && !self.zero_settle.is_zero() {
            debug!("Waiting {:?} for tare to settle", self.zero_settle);
            sleep(self.zero_settle).await;
        }
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        debug!("load cell has no outputs to stop");
        Ok(())
    }
}

/// Mock load cell: `base ± noise` on the force channel
pub struct MockLoadCell {
    core: MockCore,
    tare: f64,
    held: Option<Reading>,
}

impl MockLoadCell {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            core: MockCore::new(config),
            tare: 0.0,
            held: None,
        }
    }

    pub fn probe(&self) -> super::MockProbe {
        self.core.probe()
    }
}

#[async_trait]
impl Instrument for MockLoadCell {
    fn kind(&self) -> DeviceKind {
        DeviceKind::LoadCell
    }

    fn model(&self) -> &'static str {
        "mock load cell"
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
        if channel != Channel::Force {
            return Err(unsupported(self.kind(), format!("channel {:?}", channel)));
        }
        if let Some(held) = self.held {
            self.core.command().await?;
            return Ok(held);
        }
        let unit = self.core.unit_or(Unit::KilogramForce);
        let base = self.core.config().base - self.tare;
        self.core.sample(base, unit, 3).await
    }

    async fn set_parameter(&mut self, parameter: Parameter, _value: f64) -> Result<()> {
        Err(unsupported(self.kind(), format!("parameter {:?}", parameter)))
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Zero => {
                self.core.command().await?;
                self.tare = self.core.config().base;
            }
            Action::Hold => {
                let unit = self.core.unit_or(Unit::KilogramForce);
                let base = self.core.config().base - self.tare;
                self.held = Some(self.core.sample(base, unit, 3).await?);
            }
            Action::HoldRelease => {
                self.core.command().await?;
                self.held = None;
            }
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
        self.held = None;
        Ok(())
    }
}
