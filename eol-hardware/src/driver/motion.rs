//! Motion drivers: one AJINEXTEK axis through the AXL library, and its mock

use super::mock::MockCore;
use super::{unsupported, AxlLink, CommandPolicy, DeviceHandle, EmergencyStop, Instrument, MockProbe};
use crate::codec::axl::{self, HomeResult};
use crate::transport::AxlLibrary;
use async_trait::async_trait;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, EolError, ErrorRecord, Parameter,
    Reading, Result, Unit,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Library slot shared with the out-of-band stopper; filled while connected
pub(crate) type LibrarySlot = Arc<Mutex<Option<Arc<AxlLibrary>>>>;

pub(crate) fn set_slot(slot: &LibrarySlot, library: Option<Arc<AxlLibrary>>) {
    match slot.lock() {
        Ok(mut guard) => *guard = library,
        Err(poisoned) => *poisoned.into_inner() = library,
    }
}

pub(crate) fn slot_library(slot: &LibrarySlot) -> Option<Arc<AxlLibrary>> {
    match slot.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Open the shared library and make sure at least one board answers
pub(crate) async fn open_link(path: &Path, irq: i32) -> Result<AxlLink> {
    let library = AxlLibrary::shared(path)?;
    library.open(irq)?;
    if library.supports("AxlGetBoardCount") {
        let boards = library.board_count()?;
        if boards == 0 {
            return Err(EolError::DeviceFault {
                code: axl::AXT_RT_INVALID_BOARD_NO as i32,
                message: "AXL library reports no boards".to_string(),
            });
        }
        debug!("AXL boards detected: {}", boards);
    }
    Ok(AxlLink { library })
}

pub struct AxlMotion {
    library_path: PathBuf,
    irq: i32,
    axis: i32,
    velocity: f64,
    acceleration: f64,
    poll: Duration,
    motion_timeout: Duration,
    policy: CommandPolicy,
    handle: DeviceHandle<AxlLink>,
    slot: LibrarySlot,
}

impl AxlMotion {
    pub fn new(library: &Path, irq: i32, config: &DeviceConfig) -> Self {
        let axis = config.options.axis;
        Self {
            handle: DeviceHandle::new(format!("motion axis {}", axis)),
            library_path: library.to_path_buf(),
            irq,
            axis,
            velocity: config.options.velocity,
            acceleration: config.options.acceleration,
            poll: Duration::from_millis(config.options.motion_poll_ms.max(1)),
            motion_timeout: Duration::from_millis(config.options.motion_timeout_ms),
            policy: CommandPolicy::from(&config.retry),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Moves and homing are never repeated automatically
    fn motion_policy(&self) -> CommandPolicy {
        CommandPolicy {
            retries: 0,
            ..self.policy
        }
    }

    async fn servo(&mut self, on: bool) -> Result<()> {
        let axis = self.axis;
        self.handle
            .call(&self.policy, move |link| {
                Box::pin(async move { link.library.servo_on(axis, on) })
            })
            .await
    }

    async fn move_to(&mut self, position: f64) -> Result<()> {
        let (axis, velocity, accel) = (self.axis, self.velocity, self.acceleration);
        let (poll, limit) = (self.poll, self.motion_timeout);
        info!("Axis {} moving to {:.3} mm", axis, position);

        self.handle
            .call(&self.motion_policy(), move |link| {
                Box::pin(async move {
                    link.library
                        .move_start_pos(axis, position, velocity, accel, accel)?;
                    match timeout(limit, wait_idle(&link.library, axis, poll)).await {
                        Ok(done) => done,
                        Err(_) => {
                            if let Err(e) = link.library.move_stop(axis, accel) {
                                warn!("Axis {} stop after timeout failed: {}", axis, e);
                            }
                            Err(EolError::Timeout(format!(
                                "axis {} did not reach {:.3} within {} ms",
                                axis,
                                position,
                                limit.as_millis()
                            )))
                        }
                    }
                })
            })
            .await
    }

    async fn home(&mut self) -> Result<()> {
        let (axis, poll, limit) = (self.axis, self.poll, self.motion_timeout);
        info!("Axis {} homing", axis);

        self.handle
            .call(&self.motion_policy(), move |link| {
                Box::pin(async move {
                    link.library.home_start(axis)?;
                    timeout(limit, wait_homed(&link.library, axis, poll))
                        .await
                        .map_err(|_| {
                            EolError::Timeout(format!(
                                "axis {} homing exceeded {} ms",
                                axis,
                                limit.as_millis()
                            ))
                        })?
                })
            })
            .await
    }
}

async fn wait_idle(library: &AxlLibrary, axis: i32, poll: Duration) -> Result<()> {
    while library.in_motion(axis)? {
        sleep(poll).await;
    }
    if library.supports("AxmSignalReadServoAlarm") && library.servo_alarm(axis)? {
        return Err(EolError::DeviceFault {
            code: axl::AXT_RT_MOTION_ERROR as i32,
            message: format!("axis {} servo alarm", axis),
        });
    }
    Ok(())
}

async fn wait_homed(library: &AxlLibrary, axis: i32, poll: Duration) -> Result<()> {
    loop {
        let result: HomeResult = library.home_result(axis)?;
        if let Some(done) = result.into_result(axis) {
            return done;
        }
        sleep(poll).await;
    }
}

#[async_trait]
impl Instrument for AxlMotion {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Motion
    }

    fn model(&self) -> &'static str {
        "AJINEXTEK AXL"
    }

    fn status(&self) -> DeviceStatus {
        self.handle.status()
    }

    fn last_error(&self) -> Option<ErrorRecord> {
        self.handle.last_error()
    }

    async fn connect(&mut self) -> Result<()> {
        let (path, irq) = (&self.library_path, self.irq);
        self.handle.connect_with(|| open_link(path, irq)).await?;
        let library = self.handle.connection()?.library.clone();
        set_slot(&self.slot, Some(library));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        set_slot(&self.slot, None);
        self.handle.disconnect().await;
        Ok(())
    }

    async fn read_measurement(&mut self, channel: Channel) -> Result<Reading> {
        if channel != Channel::Position {
            return Err(unsupported(self.kind(), format!("channel {:?}", channel)));
        }
        let axis = self.axis;
        let position = self
            .handle
            .call(&self.policy, move |link| {
                Box::pin(async move { link.library.actual_position(axis) })
            })
            .await?;
        Ok(Reading::new(position, Unit::Millimeter, 3))
    }

    async fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        if value <= 0.0 {
            return Err(EolError::InvalidInput(format!(
                "{:?} must be positive, got {}",
                parameter, value
            )));
        }
        match parameter {
            Parameter::Velocity => self.velocity = value,
            Parameter::Acceleration => self.acceleration = value,
            other => return Err(unsupported(self.kind(), format!("parameter {:?}", other))),
        }
        Ok(())
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        match action {
            Action::ServoOn => self.servo(true).await,
            Action::ServoOff => self.servo(false).await,
            Action::Home => self.home().await,
            Action::MoveTo { position } => self.move_to(position).await,
            Action::Stop => {
                let (axis, decel) = (self.axis, self.acceleration);
                self.handle
                    .call(&self.policy, move |link| {
                        Box::pin(async move { link.library.move_stop(axis, decel) })
                    })
                    .await
            }
            other => Err(unsupported(self.kind(), format!("{:?}", other))),
        }
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        AxlMotionStopper {
            slot: self.slot.clone(),
            axis: self.axis,
        }
        .trip()
    }

    async fn make_safe(&mut self) -> Result<()> {
        let Some(library) = slot_library(&self.slot) else {
            return Ok(());
        };
        library.move_stop(self.axis, self.acceleration)?;
        library.servo_on(self.axis, false)
    }

    fn emergency_stopper(&self) -> Option<Arc<dyn EmergencyStop>> {
        Some(Arc::new(AxlMotionStopper {
            slot: self.slot.clone(),
            axis: self.axis,
        }))
    }
}

pub struct AxlMotionStopper {
    slot: LibrarySlot,
    axis: i32,
}

impl EmergencyStop for AxlMotionStopper {
    fn device(&self) -> DeviceKind {
        DeviceKind::Motion
    }

    /// Immediate stop, then servo off. Both are attempted.
    fn trip(&self) -> Result<()> {
        let Some(library) = slot_library(&self.slot) else {
            debug!("axis {} not connected, nothing to stop", self.axis);
            return Ok(());
        };
        let stopped = library.emergency_stop(self.axis);
        let servo = library.servo_on(self.axis, false);
        warn!("Axis {} emergency stopped", self.axis);
        stopped.and(servo)
    }
}

/// Mock axis: moves complete instantly, position reads back with noise
pub struct MockMotion {
    core: MockCore,
    position: f64,
    servo: Arc<AtomicBool>,
}

impl MockMotion {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            position: config.mock.base,
            core: MockCore::new(config),
            servo: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn probe(&self) -> MockProbe {
        self.core.probe()
    }

    pub fn servo_enabled(&self) -> bool {
        self.servo.load(Ordering::SeqCst)
    }

    fn require_servo(&self) -> Result<()> {
        if self.servo_enabled() {
            Ok(())
        } else {
            Err(EolError::DeviceFault {
                code: axl::AXT_RT_MOTION_ERROR as i32,
                message: "servo is off".to_string(),
            })
        }
    }
}

#[async_trait]
impl Instrument for MockMotion {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Motion
    }

    fn model(&self) -> &'static str {
        "mock motion"
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
        if channel != Channel::Position {
            return Err(unsupported(self.kind(), format!("channel {:?}", channel)));
        }
        self.core.sample(self.position, Unit::Millimeter, 3).await
    }

    async fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        self.core.command().await?;
        match parameter {
            Parameter::Velocity | Parameter::Acceleration if value > 0.0 => Ok(()),
            Parameter::Velocity | Parameter::Acceleration => Err(EolError::InvalidInput(
                format!("{:?} must be positive, got {}", parameter, value),
            )),
            other => Err(unsupported(self.kind(), format!("parameter {:?}", other))),
        }
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        self.core.command().await?;
        match action {
            Action::ServoOn => self.servo.store(true, Ordering::SeqCst),
            Action::ServoOff => self.servo.store(false, Ordering::SeqCst),
            Action::Home => {
                self.require_servo()?;
                self.position = 0.0;
            }
            Action::MoveTo { position } => {
                self.require_servo()?;
                self.position = position;
            }
            Action::Stop => {}
            other => return Err(unsupported(self.kind(), format!("{:?}", other))),
        }
        Ok(())
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        self.core.probe().count_emergency_stop();
        self.servo.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn make_safe(&mut self) -> Result<()> {
        self.core.probe().count_make_safe();
        self.servo.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn emergency_stopper(&self) -> Option<Arc<dyn EmergencyStop>> {
        Some(Arc::new(MockMotionStopper {
            servo: self.servo.clone(),
            probe: self.core.probe(),
        }))
    }
}

struct MockMotionStopper {
    servo: Arc<AtomicBool>,
    probe: MockProbe,
}

impl EmergencyStop for MockMotionStopper {
    fn device(&self) -> DeviceKind {
        DeviceKind::Motion
    }

    fn trip(&self) -> Result<()> {
        self.servo.store(false, Ordering::SeqCst);
        self.probe.count_emergency_stop();
        Ok(())
    }
}
