//! The live device table owned by the worker

use eol_core::{DeviceConfig, DeviceKind, DeviceStatus, EolError, ErrorRecord, Result};
use eol_hardware::{build_driver, EmergencyStop, Instrument};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One driver per device family. Only the worker thread touches it.
#[derive(Default)]
pub struct DeviceTable {
    devices: BTreeMap<DeviceKind, Box<dyn Instrument>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured driver
    pub fn from_configs(configs: &[DeviceConfig]) -> Result<Self> {
        let mut table = Self::new();
        for config in configs {
            if table.insert(build_driver(config)?).is_some() {
                return Err(EolError::Config(format!(
                    "device '{}' configured more than once",
                    config.kind
                )));
            }
        }
        Ok(table)
    }

    /// Install `driver`, returning the one it replaces
    pub fn insert(&mut self, driver: Box<dyn Instrument>) -> Option<Box<dyn Instrument>> {
        debug!("Device table: {} -> {}", driver.kind(), driver.model());
        self.devices.insert(driver.kind(), driver)
    }

    pub fn get(&mut self, kind: DeviceKind) -> Result<&mut dyn Instrument> {
        match self.devices.get_mut(&kind) {
            Some(driver) => Ok(driver.as_mut()),
            None => Err(EolError::DeviceNotConfigured(kind.to_string())),
        }
    }

    pub fn contains(&self, kind: DeviceKind) -> bool {
        self.devices.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<DeviceKind> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn statuses(&self) -> Vec<(DeviceKind, DeviceStatus)> {
        self.devices
            .iter()
            .map(|(kind, driver)| (*kind, driver.status()))
            .collect()
    }

    /// Out-of-band stoppers of every driver that has one
    pub fn stoppers(&self) -> Vec<Arc<dyn EmergencyStop>> {
        self.devices
            .values()
            .filter_map(|driver| driver.emergency_stopper())
            .collect()
    }

    /// Connect every device; failures are collected, not fatal
    pub async fn connect_all(&mut self) -> Vec<(DeviceKind, ErrorRecord)> {
        let mut failures = Vec::new();
        for (kind, driver) in self.devices.iter_mut() {
            if let Err(e) = driver.connect().await {
                warn!("{} failed to connect: {}", kind, e);
                failures.push((*kind, e.to_record()));
            }
        }
        failures
    }

    /// Put `kinds` into their safe state. Every device is attempted.
    pub async fn make_safe(&mut self, kinds: &[DeviceKind]) -> Vec<ErrorRecord> {
        let mut failures = Vec::new();
        for kind in kinds {
            let Some(driver) = self.devices.get_mut(kind) else {
                continue;
            };
            if let Err(e) = driver.make_safe().await {
                warn!("{} could not be made safe: {}", kind, e);
                failures.push(e.to_record());
            }
        }
        failures
    }

    pub async fn make_safe_all(&mut self) -> Vec<ErrorRecord> {
        let kinds = self.kinds();
        self.make_safe(&kinds).await
    }

    pub async fn disconnect_all(&mut self) {
        for (kind, driver) in self.devices.iter_mut() {
            if let Err(e) = driver.disconnect().await {
                warn!("{} disconnect failed: {}", kind, e);
            }
        }
        info!("All devices disconnected");
    }
}
