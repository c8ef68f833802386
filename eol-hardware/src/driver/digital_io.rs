//! Digital I/O drivers: AXL DIO module bits, and their mock

use super::mock::MockCore;
use super::motion::{open_link, set_slot, slot_library, LibrarySlot};
use super::{unsupported, AxlLink, CommandPolicy, DeviceHandle, EmergencyStop, Instrument, MockProbe};
use crate::transport::AxlLibrary;
use async_trait::async_trait;
use eol_core::{
    Action, Channel, DeviceConfig, DeviceKind, DeviceStatus, ErrorRecord, Parameter, Reading,
    Result,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// All bits live on the first DIO module
const MODULE: i32 = 0;

/// Drive every listed output low. Each bit is attempted; the first error
/// is returned.
fn drive_low(library: &AxlLibrary, outputs: &[u16]) -> Result<()> {
    let mut first_error = None;
    for &bit in outputs {
        if let Err(e) = library.write_output(MODULE, i32::from(bit), false) {
            warn!("DIO output {} could not be driven low: {}", bit, e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

pub struct AxlDigitalIo {
    library_path: PathBuf,
    irq: i32,
    safe_outputs: Vec<u16>,
    policy: CommandPolicy,
    handle: DeviceHandle<AxlLink>,
    slot: LibrarySlot,
}

impl AxlDigitalIo {
    pub fn new(library: &Path, irq: i32, config: &DeviceConfig) -> Self {
        Self {
            handle: DeviceHandle::new(format!("dio {}", library.display())),
            library_path: library.to_path_buf(),
            irq,
            safe_outputs: config.options.safe_outputs.clone(),
            policy: CommandPolicy::from(&config.retry),
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl Instrument for AxlDigitalIo {
    fn kind(&self) -> DeviceKind {
        DeviceKind::DigitalIo
    }

    fn model(&self) -> &'static str {
        "AJINEXTEK DIO"
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
        let high = match channel {
            Channel::Input(bit) => {
                self.handle
                    .call(&self.policy, move |link| {
                        Box::pin(async move { link.library.read_input(MODULE, i32::from(bit)) })
                    })
                    .await?
            }
            Channel::Output(bit) => {
                self.handle
                    .call(&self.policy, move |link| {
                        Box::pin(async move { link.library.read_output(MODULE, i32::from(bit)) })
                    })
                    .await?
            }
            other => return Err(unsupported(self.kind(), format!("channel {:?}", other))),
        };
        Ok(Reading::level(high))
    }

    async fn set_parameter(&mut self, parameter: Parameter, _value: f64) -> Result<()> {
        Err(unsupported(self.kind(), format!("parameter {:?}", parameter)))
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        match action {
            Action::WriteOutput { channel, level } => {
                debug!("DIO output {} -> {}", channel, level);
                self.handle
                    .call(&self.policy, move |link| {
                        Box::pin(async move {
                            link.library.write_output(MODULE, i32::from(channel), level)
                        })
                    })
                    .await
            }
            other => Err(unsupported(self.kind(), format!("{:?}", other))),
        }
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        self.make_safe().await
    }

    async fn make_safe(&mut self) -> Result<()> {
        match slot_library(&self.slot) {
            Some(library) => drive_low(&library, &self.safe_outputs),
            None => Ok(()),
        }
    }

    fn emergency_stopper(&self) -> Option<Arc<dyn EmergencyStop>> {
        Some(Arc::new(AxlOutputStopper {
            slot: self.slot.clone(),
            outputs: self.safe_outputs.clone(),
        }))
    }
}

pub struct AxlOutputStopper {
    slot: LibrarySlot,
    outputs: Vec<u16>,
}

impl EmergencyStop for AxlOutputStopper {
    fn device(&self) -> DeviceKind {
        DeviceKind::DigitalIo
    }

    fn trip(&self) -> Result<()> {
        match slot_library(&self.slot) {
            Some(library) => drive_low(&library, &self.outputs),
            None => Ok(()),
        }
    }
}

type Bits = Arc<Mutex<HashMap<u16, bool>>>;

fn bit(bits: &Bits, index: u16) -> Option<bool> {
    match bits.lock() {
        Ok(map) => map.get(&index).copied(),
        Err(poisoned) => poisoned.into_inner().get(&index).copied(),
    }
}

fn set_bit(bits: &Bits, index: u16, level: bool) {
    match bits.lock() {
        Ok(mut map) => {
            map.insert(index, level);
        }
        Err(poisoned) => {
            poisoned.into_inner().insert(index, level);
        }
    }
}

/// Mock DIO. Unset inputs read high when the mock base is non-zero.
pub struct MockDigitalIo {
    core: MockCore,
    inputs: Bits,
    outputs: Bits,
    safe_outputs: Vec<u16>,
}

impl MockDigitalIo {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            core: MockCore::new(config),
            inputs: Arc::default(),
            outputs: Arc::default(),
            safe_outputs: config.options.safe_outputs.clone(),
        }
    }

    pub fn probe(&self) -> MockProbe {
        self.core.probe()
    }

    /// Force an input level, as a fixture switch would
    pub fn set_input(&self, index: u16, level: bool) {
        set_bit(&self.inputs, index, level);
    }

    pub fn output(&self, index: u16) -> bool {
        bit(&self.outputs, index).unwrap_or(false)
    }
}

#[async_trait]
impl Instrument for MockDigitalIo {
    fn kind(&self) -> DeviceKind {
        DeviceKind::DigitalIo
    }

    fn model(&self) -> &'static str {
        "mock dio"
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
        self.core.command().await?;
        let high = match channel {
            Channel::Input(index) => {
                bit(&self.inputs, index).unwrap_or(self.core.config().base != 0.0)
            }
            Channel::Output(index) => self.output(index),
            other => return Err(unsupported(self.kind(), format!("channel {:?}", other))),
        };
        Ok(Reading::level(high))
    }

    async fn set_parameter(&mut self, parameter: Parameter, _value: f64) -> Result<()> {
        Err(unsupported(self.kind(), format!("parameter {:?}", parameter)))
    }

    async fn actuate(&mut self, action: Action) -> Result<()> {
        match action {
            Action::WriteOutput { channel, level } => {
                self.core.command().await?;
                set_bit(&self.outputs, channel, level);
                Ok(())
            }
            other => Err(unsupported(self.kind(), format!("{:?}", other))),
        }
    }

    async fn emergency_stop(&mut self) -> Result<()> {
        self.core.probe().count_emergency_stop();
        for &index in &self.safe_outputs {
            set_bit(&self.outputs, index, false);
        }
        Ok(())
    }

    async fn make_safe(&mut self) -> Result<()> {
        self.core.probe().count_make_safe();
        for &index in &self.safe_outputs {
            set_bit(&self.outputs, index, false);
        }
        Ok(())
    }

    fn emergency_stopper(&self) -> Option<Arc<dyn EmergencyStop>> {
        Some(Arc::new(MockOutputStopper {
            outputs: self.outputs.clone(),
            safe_outputs: self.safe_outputs.clone(),
            probe: self.core.probe(),
        }))
    }
}

struct MockOutputStopper {
    outputs: Bits,
    safe_outputs: Vec<u16>,
    probe: MockProbe,
}

impl EmergencyStop for MockOutputStopper {
    fn device(&self) -> DeviceKind {
        DeviceKind::DigitalIo
    }

    fn trip(&self) -> Result<()> {
        for &index in &self.safe_outputs {
            set_bit(&self.outputs, index, false);
        }
        self.probe.count_emergency_stop();
        Ok(())
    }
}
