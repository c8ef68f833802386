//! MCU drivers: LMA temperature controller over serial, and its mock
//!
//! Every command is acknowledged by a status frame. Commands that move the
//! unit to a new temperature are followed by a "reached" notification,
//! which can take tens of seconds; that wait is bounded by
//! `options.status_timeout_ms`.

use super::mock::MockCore;
use super::{unsupported, CommandPolicy, DeviceHandle, Instrument};
use crate::codec::lma::{self, McuCommand, McuResponse, McuStatus};
use crate::codec::ResponseFrame;
use crate::transport::{self, Backoff, SerialTransport, Session, Transport};
use async_trait::async_trait;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, EolError, ErrorRecord, Parameter,
    Reading, Result, Unit,
};
use std::time::Duration;
use tracing::{debug, info};

/// Frames of other types tolerated while waiting for an acknowledgement
const MAX_INTERLEAVED_FRAMES: usize = 16;

pub struct LmaMcu<T: Transport = SerialTransport> {
    transport: T,
    backoff: Backoff,
    policy: CommandPolicy,
    handle: DeviceHandle<T::Session>,
    status_timeout: Duration,
}

impl LmaMcu<SerialTransport> {
    pub fn serial(port: &str, baud_rate: u32, config: &DeviceConfig) -> Self {
        Self::with_transport(SerialTransport::new(port, baud_rate, lma::framing()), config)
    }
}

impl<T: Transport> LmaMcu<T> {
    pub fn with_transport(transport: T, config: &DeviceConfig) -> Self {
        let handle = DeviceHandle::new(format!("mcu {}", transport.target()));
        Self {
            transport,
            backoff: Backoff::from(&config.retry),
            policy: CommandPolicy::from(&config.retry),
            handle,
            status_timeout: Duration::from_millis(config.options.status_timeout_ms),
        }
    }

    /// Send `command` and wait for its acknowledgement
    async fn exchange(&mut self, command: McuCommand) -> Result<McuResponse> {
        let frame = lma::encode(&command)?;
        let expected = command.expected_status();
        let timeout = self.policy.timeout;
        debug!("MCU {:?}", command);

        self.handle
            .call(&self.policy, move |session| {
                let frame = frame.clone();
                Box::pin(async move {
                    session.send(frame.as_bytes()).await?;
                    await_ack(session, expected, timeout).await
                })
            })
            .await
    }

    /// Send `command`, then wait for its completion notification if it has one
    async fn run(&mut self, command: McuCommand) -> Result<McuResponse> {
        let ack = self.exchange(command).await?;
        if let Some(status) = command.completion() {
            self.wait_notification(status).await?;
        }
        Ok(ack)
    }

    async fn wait_notification(&mut self, status: McuStatus) -> Result<()> {
        let deadline = self.status_timeout;
        let policy = CommandPolicy {
            timeout: deadline,
            retries: 0,
            ..self.policy
        };
        debug!("Waiting up to {:?} for MCU {:?}", deadline, status);

        self.handle
            .call(&policy, move |session| {
                Box::pin(async move {
                    tokio::time::timeout(deadline, await_notification(session, status, deadline))
                        .await
                        .map_err(|_| {
                            EolError::Timeout(format!(
                                "MCU did not report {:?} within {} ms",
                                status,
                                deadline.as_millis()
                            ))
                        })?
                })
            })
            .await
    }
}

async fn await_ack<S: Session>(
    session: &mut S,
    expected: McuStatus,
    timeout: Duration,
) -> Result<McuResponse> {
    for _ in 0..MAX_INTERLEAVED_FRAMES {
        let raw = session.receive(timeout).await?;
        let response = lma::decode(&ResponseFrame::from(raw))?;
        if response.status == expected {
            return Ok(response);
        }
        if !response.status.is_notification() {
            return Err(EolError::Protocol(format!(
                "MCU answered {:?}, expected {:?}",
                response.status, expected
            )));
        }
        debug!("MCU notification {:?} while waiting for {:?}", response.status, expected);
    }
    Err(EolError::Protocol(format!(
        "no {:?} acknowledgement within {} frames",
        expected, MAX_INTERLEAVED_FRAMES
    )))
}

async fn await_notification<S: Session>(
    session: &mut S,
    status: McuStatus,
    deadline: Duration,
) -> Result<()> {
    loop {
        let raw = session.receive(deadline).await?;
        match lma::decode(&ResponseFrame::from(raw)) {
            Ok(response) if response.status == status => return Ok(()),
            Ok(response) => debug!("MCU {:?} while waiting for {:?}", response.status, status),
            Err(e) => debug!("Skipping undecodable MCU frame: {}", e),
        }
    }
}

fn temperature_command(parameter: Parameter, value: f64) -> Option<McuCommand> {
    match parameter {
        Parameter::UpperTemperature => Some(McuCommand::SetUpperTemperature(value)),
        Parameter::OperatingTemperature => Some(McuCommand::SetOperatingTemperature(value)),
        Parameter::CoolingTemperature => Some(McuCommand::SetCoolingTemperature(value)),
        _ => None,
    }
}

#[async_trait]
impl<T> Instrument for LmaMcu<T>
where
    T: Transport + 'static,
{
    fn kind(&self) -> DeviceKind {
        DeviceKind::Mcu
    }

    fn model(&self) -> &'static str {
        "LMA"
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
            .await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.handle.disconnect().await;
        Ok(())
    }

    async fn read_measurement(&mut self, channel: Channel) -> Result<Reading> {
        if channel != Channel::Temperature {
            return Err(unsupported(self.kind(), format!("channel {:?}", channel)));
        }
        let response = self.exchange(McuCommand::RequestTemperature).await?;
        let (max, _min) = response.temperatures()?;
        Ok(Reading::new(max, Unit::Celsius, 1))
    }

    async fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        let command = match parameter {
            Parameter::FanSpeed => McuCommand::SetFanSpeed(lma::fan_level(value)?),
            Parameter::TestMode => {
                if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
                    return Err(EolError::InvalidInput(format!("test mode {}", value)));
                }
                McuCommand::EnterTestMode(value as u32)
            }
            other => temperature_command(other, value)
                .ok_or_else(|| unsupported(DeviceKind::Mcu, format!("parameter {:?}", other)))?,
        };
        self.run(command).await?;
        Ok(())
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        match action {
            Action::StandbyHeating {
                operating,
                standby,
                hold_ms,
            } => {
                info!("MCU standby heating {}°C / {}°C", operating, standby);
                self.run(McuCommand::LmaInit {
                    operating,
                    standby,
                    hold_ms,
                })
                .await?;
            }
            Action::StandbyCooling => {
                info!("MCU standby cooling");
                self.run(McuCommand::StrokeInitComplete).await?;
            }
            Action::StrokeInitComplete => {
                self.exchange(McuCommand::StrokeInitComplete).await?;
            }
            Action::WaitBoot => self.wait_notification(McuStatus::BootComplete).await?,
            other => return Err(unsupported(self.kind(), format!("{:?}", other))),
        }
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        debug!("MCU has no emergency stop command");
        Ok(())
    }
}

/// Mock MCU: temperature follows the last commanded target
pub struct MockMcu {
    core: MockCore,
    temperature: f64,
    upper_limit: Option<f64>,
    fan_level: u8,
    test_mode: u32,
}

impl MockMcu {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            temperature: config.mock.base,
            core: MockCore::new(config),
            upper_limit: None,
            fan_level: lma::FAN_LEVEL_MIN,
            test_mode: 0,
        }
    }

    pub fn probe(&self) -> super::MockProbe {
        self.core.probe()
    }

    pub fn fan_level(&self) -> u8 {
        self.fan_level
    }

    pub fn test_mode(&self) -> u32 {
        self.test_mode
    }

    fn heat_to(&mut self, target: f64) -> Result<()> {
        if let Some(limit) = self.upper_limit {
            if target > limit {
                return Err(EolError::InvalidInput(format!(
                    "target {}°C above upper limit {}°C",
                    target, limit
                )));
            }
        }
        self.temperature = target;
        Ok(())
    }
}

#[async_trait]
impl Instrument for MockMcu {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Mcu
    }

    fn model(&self) -> &'static str {
        "mock mcu"
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
        if channel != Channel::Temperature {
            return Err(unsupported(self.kind(), format!("channel {:?}", channel)));
        }
        let unit = self.core.unit_or(Unit::Celsius);
        self.core.sample(self.temperature, unit, 1).await
    }

    async fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        self.core.command().await?;
        match parameter {
            Parameter::UpperTemperature => self.upper_limit = Some(value),
            Parameter::OperatingTemperature | Parameter::CoolingTemperature => {
                self.heat_to(value)?
            }
            Parameter::FanSpeed => self.fan_level = lma::fan_level(value)?,
            Parameter::TestMode => self.test_mode = value as u32,
            other => return Err(unsupported(self.kind(), format!("parameter {:?}", other))),
        }
        Ok(())
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        self.core.command().await?;
        match action {
            Action::StandbyHeating { operating, .. } => self.heat_to(operating)?,
            Action::StandbyCooling => self.temperature = self.core.config().base,
            Action::StrokeInitComplete | Action::WaitBoot => {}
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PipeTransport;
    use eol_core::RetryConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn config() -> DeviceConfig {
        let mut config = DeviceConfig::mock(DeviceKind::Mcu);
        config.retry = RetryConfig {
            connect_attempts: 1,
            command_timeout_ms: 100,
            command_retries: 0,
            ..RetryConfig::default()
        };
        config.options.status_timeout_ms = 200;
        config
    }

    async fn read_frame(device: &mut DuplexStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        device.read_exact(&mut header).await.unwrap();
        let mut rest = vec![0u8; header[3] as usize + 2];
        device.read_exact(&mut rest).await.unwrap();
        let mut frame = header.to_vec();
        frame.extend(rest);
        frame
    }

    fn status_frame(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xFF, code, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0xFE, 0xFE]);
        frame
    }

    async fn connected() -> (LmaMcu<PipeTransport>, DuplexStream) {
        let transport = PipeTransport::new("lma", lma::framing());
        let device = transport.pipe();
        let mut mcu = LmaMcu::with_transport(transport, &config());
        mcu.connect().await.unwrap();
        (mcu, device)
    }

    #[tokio::test]
    async fn test_fan_speed_skips_notifications() {
        let (mut mcu, mut device) = connected().await;
        let peer = tokio::spawn(async move {
            let request = read_frame(&mut device).await;
            // noise, an unsolicited notification, then the ack
            device.write_all(&[0x00, 0x13]).await.unwrap();
            device.write_all(&status_frame(0x09, &[])).await.unwrap();
            device.write_all(&status_frame(0x03, &[0x05])).await.unwrap();
            request
        });

        mcu.set_parameter(Parameter::FanSpeed, 50.0).await.unwrap();
        assert_eq!(
            peer.await.unwrap(),
            vec![0xFF, 0xFF, 0x03, 0x01, 0x05, 0xFE, 0xFE]
        );
    }

    #[tokio::test]
    async fn test_read_temperature() {
        let (mut mcu, mut device) = connected().await;
        tokio::spawn(async move {
            read_frame(&mut device).await;
            let mut payload = 452u32.to_be_bytes().to_vec();
            payload.extend_from_slice(&300u32.to_be_bytes());
            device.write_all(&status_frame(0x07, &payload)).await.unwrap();
            let _ = device.read(&mut [0u8; 1]).await;
        });

        let reading = mcu.read_measurement(Channel::Temperature).await.unwrap();
        assert!((reading.value - 45.2).abs() < 1e-9);
        assert_eq!(reading.unit, Unit::Celsius);
    }

    #[tokio::test]
    async fn test_heating_waits_for_reached_notification() {
        let (mut mcu, mut device) = connected().await;
        tokio::spawn(async move {
            read_frame(&mut device).await;
            device.write_all(&status_frame(0x05, &[])).await.unwrap();
            device.write_all(&status_frame(0x09, &[])).await.unwrap();
            device.write_all(&status_frame(0x0B, &[])).await.unwrap();
            let _ = device.read(&mut [0u8; 1]).await;
        });

        mcu.set_parameter(Parameter::OperatingTemperature, 60.0)
            .await
            .unwrap();
        assert_eq!(mcu.status(), DeviceStatus::Connected);
    }

    #[tokio::test]
    async fn test_missing_notification_times_out() {
        let (mut mcu, mut device) = connected().await;
        tokio::spawn(async move {
            read_frame(&mut device).await;
            device.write_all(&status_frame(0x06, &[])).await.unwrap();
            let _ = device.read(&mut [0u8; 1]).await;
        });

        let err = mcu
            .set_parameter(Parameter::CoolingTemperature, 25.0)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unexpected_ack_is_protocol_error() {
        let (mut mcu, mut device) = connected().await;
        tokio::spawn(async move {
            read_frame(&mut device).await;
            device.write_all(&status_frame(0x02, &[])).await.unwrap();
            let _ = device.read(&mut [0u8; 1]).await;
        });

        let err = mcu
            .set_parameter(Parameter::TestMode, 1.0)
            .await
            .unwrap_err();
        assert_eq!(err.class(), eol_core::ErrorClass::Protocol);
    }

    #[tokio::test]
    async fn test_mock_enforces_upper_limit() {
        let mut mcu = MockMcu::new(&DeviceConfig::mock(DeviceKind::Mcu));
        mcu.connect().await.unwrap();
        mcu.set_parameter(Parameter::UpperTemperature, 80.0)
            .await
            .unwrap();
        mcu.set_parameter(Parameter::OperatingTemperature, 60.0)
            .await
            .unwrap();
        assert_eq!(
            mcu.read_measurement(Channel::Temperature).await.unwrap().value,
            60.0
        );
        assert!(mcu
            .set_parameter(Parameter::OperatingTemperature, 90.0)
            .await
            .is_err());
        mcu.set_parameter(Parameter::FanSpeed, 100.0).await.unwrap();
        assert_eq!(mcu.fan_level(), 10);
    }
}
