//! # Meter Devices
//!
//! Maps named device functions (`totalPower`, `currentVoltagePhase1`, ...)
//! to Modbus functions on a concrete device and port, and wires configured
//! ports and devices together in a [`PortRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AdapterConfig, DeviceConfig, DriverOptions};
use crate::driver::{PortDriver, SerialPortDriver};
use crate::error::{ModbusError, ModbusResult};
use crate::function::{FunctionExecutor, ModbusFunction};
use crate::health::Health;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::port::{NoopPortCleaner, PortCleaner, PortEnumerator, SerialPortFactory};
use crate::register::RegisterId;
use crate::value::ModbusValue;

/// Named measurement a device can be configured to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceFunction {
    TotalPower,
    ProducedPower,
    ConsumedPower,
    CurrentPower,
    DeviceId,
    CurrentVoltagePhase1,
    CurrentVoltagePhase2,
    CurrentVoltagePhase3,
    CurrentAmperagePhase1,
    CurrentAmperagePhase2,
    CurrentAmperagePhase3,
}

impl DeviceFunction {
    pub const ALL: [DeviceFunction; 11] = [
        DeviceFunction::TotalPower,
        DeviceFunction::ProducedPower,
        DeviceFunction::ConsumedPower,
        DeviceFunction::CurrentPower,
        DeviceFunction::DeviceId,
        DeviceFunction::CurrentVoltagePhase1,
        DeviceFunction::CurrentVoltagePhase2,
        DeviceFunction::CurrentVoltagePhase3,
        DeviceFunction::CurrentAmperagePhase1,
        DeviceFunction::CurrentAmperagePhase2,
        DeviceFunction::CurrentAmperagePhase3,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            DeviceFunction::TotalPower => "totalPower",
            DeviceFunction::ProducedPower => "producedPower",
            DeviceFunction::ConsumedPower => "consumedPower",
            DeviceFunction::CurrentPower => "currentPower",
            DeviceFunction::DeviceId => "deviceId",
            DeviceFunction::CurrentVoltagePhase1 => "currentVoltagePhase1",
            DeviceFunction::CurrentVoltagePhase2 => "currentVoltagePhase2",
            DeviceFunction::CurrentVoltagePhase3 => "currentVoltagePhase3",
            DeviceFunction::CurrentAmperagePhase1 => "currentAmperagePhase1",
            DeviceFunction::CurrentAmperagePhase2 => "currentAmperagePhase2",
            DeviceFunction::CurrentAmperagePhase3 => "currentAmperagePhase3",
        }
    }

    /// Modbus function and register backing this measurement.
    pub const fn target(self) -> (ModbusFunction, RegisterId) {
        use DeviceFunction::*;
        match self {
            TotalPower => (ModbusFunction::ReadTotalPower, RegisterId::TotalPower),
            ProducedPower => (ModbusFunction::ReadTotalPower, RegisterId::ExportPower),
            ConsumedPower => (ModbusFunction::ReadTotalPower, RegisterId::ImportPower),
            CurrentPower => (ModbusFunction::ReadCurrentPower, RegisterId::CurrentPower),
            DeviceId => (ModbusFunction::CheckState, RegisterId::DeviceId),
            CurrentVoltagePhase1 => (ModbusFunction::ReadCurrentVoltage, RegisterId::VoltagePhase1),
            CurrentVoltagePhase2 => (ModbusFunction::ReadCurrentVoltage, RegisterId::VoltagePhase2),
            CurrentVoltagePhase3 => (ModbusFunction::ReadCurrentVoltage, RegisterId::VoltagePhase3),
            CurrentAmperagePhase1 => {
                (ModbusFunction::ReadCurrentAmperage, RegisterId::AmperagePhase1)
            }
            CurrentAmperagePhase2 => {
                (ModbusFunction::ReadCurrentAmperage, RegisterId::AmperagePhase2)
            }
            CurrentAmperagePhase3 => {
                (ModbusFunction::ReadCurrentAmperage, RegisterId::AmperagePhase3)
            }
        }
    }

    pub const fn unit(self) -> &'static str {
        match self.target().0 {
            ModbusFunction::ReadTotalPower => "kWh",
            ModbusFunction::ReadCurrentPower => "W",
            ModbusFunction::ReadCurrentVoltage => "V",
            ModbusFunction::ReadCurrentAmperage => "A",
            ModbusFunction::CheckState => "N/A",
        }
    }
}

impl fmt::Display for DeviceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceFunction {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or_else(|| ModbusError::invalid_argument(format!("unknown device function {}", s)))
    }
}

/// One measurement read from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub device: String,
    pub function: DeviceFunction,
    pub value: ModbusValue,
    pub unit: String,
}

/// A meter on a serial port.
pub struct ModbusDevice<D: PortDriver> {
    id: u8,
    name: String,
    functions: Vec<DeviceFunction>,
    driver: Arc<D>,
    executor: Arc<FunctionExecutor>,
    calls: AtomicU64,
}

impl<D: PortDriver> ModbusDevice<D> {
    pub fn new(config: &DeviceConfig, driver: Arc<D>, executor: Arc<FunctionExecutor>) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            functions: config.functions.clone(),
            driver,
            executor,
            calls: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn functions(&self) -> &[DeviceFunction] {
        &self.functions
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn supports(&self, function: DeviceFunction) -> bool {
        self.functions.contains(&function)
    }

    /// Commands issued by this device so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn query(&self, function: DeviceFunction) -> ModbusResult<DeviceResponse> {
        if !self.supports(function) {
            return Err(ModbusError::invalid_argument(format!(
                "device {} does not support function {}",
                self.name, function
            )));
        }
        self.calls.fetch_add(1, Ordering::Relaxed);

        let (modbus_function, register) = function.target();
        let value = self
            .executor
            .run(modbus_function, self.driver.as_ref(), self.id, register)
            .await?;

        Ok(DeviceResponse {
            device: self.name.clone(),
            function,
            value,
            unit: function.unit().to_string(),
        })
    }

    pub async fn query_by_name(&self, function: &str) -> ModbusResult<DeviceResponse> {
        self.query(function.parse()?).await
    }

    /// Query every configured function in order.
    pub async fn query_all(&self) -> Vec<(DeviceFunction, ModbusResult<DeviceResponse>)> {
        let mut results = Vec::with_capacity(self.functions.len());
        for &function in &self.functions {
            results.push((function, self.query(function).await));
        }
        results
    }

    /// Down if the port is closed or the device does not answer a state check.
    pub async fn health(&self) -> Health {
        if !self.driver.is_running() {
            return Health::down().with_detail(
                "error",
                format!(
                    "underlying communication port {} is not running",
                    self.driver.name()
                ),
            );
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.executor.check_state(self.driver.as_ref(), self.id).await {
            Ok(_) => Health::up(),
            Err(e) => Health::down().with_detail("error", e),
        }
    }
}

impl<D: PortDriver> fmt::Debug for ModbusDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("port", &self.driver.name())
            .field("functions", &self.functions)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Builder for [`PortRegistry`].
pub struct PortRegistryBuilder {
    config: AdapterConfig,
    factory: Arc<dyn SerialPortFactory>,
    enumerator: Option<Arc<dyn PortEnumerator>>,
    executor: Arc<FunctionExecutor>,
    cleaner: Arc<dyn PortCleaner>,
    metrics: Arc<dyn MetricsSink>,
    options: DriverOptions,
    cancel: CancellationToken,
}

impl PortRegistryBuilder {
    /// Used to warn about configured ports missing on the host.
    pub fn with_enumerator(mut self, enumerator: Arc<dyn PortEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    pub fn with_executor(mut self, executor: Arc<FunctionExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn PortCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_driver_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the configuration and start one driver per port.
    pub fn start(self) -> ModbusResult<PortRegistry> {
        self.config.validate()?;

        if let Some(enumerator) = &self.enumerator {
            match enumerator.list_ports() {
                Ok(present) => {
                    for port in &self.config.ports {
                        if !present.contains(&port.name) {
                            warn!(port = %port.name, "configured serial port not present on host");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to list serial ports"),
            }
        }

        let mut drivers = HashMap::new();
        for port in &self.config.ports {
            let driver = SerialPortDriver::builder(port.clone(), Arc::clone(&self.factory))
                .with_cleaner(Arc::clone(&self.cleaner))
                .with_metrics(Arc::clone(&self.metrics))
                .with_options(self.options)
                .with_cancellation(self.cancel.child_token())
                .start();
            drivers.insert(port.name.clone(), Arc::new(driver));
        }

        let mut devices = Vec::with_capacity(self.config.devices.len());
        for device in &self.config.devices {
            let driver = drivers.get(&device.serial_port).ok_or_else(|| {
                ModbusError::configuration(format!(
                    "device {} references unknown serial port {}",
                    device.name, device.serial_port
                ))
            })?;
            devices.push(ModbusDevice::new(
                device,
                Arc::clone(driver),
                Arc::clone(&self.executor),
            ));
        }

        info!(
            ports = drivers.len(),
            devices = devices.len(),
            "port registry started"
        );
        Ok(PortRegistry { drivers, devices })
    }
}

/// Drivers and devices built from an [`AdapterConfig`].
#[derive(Debug)]
pub struct PortRegistry {
    drivers: HashMap<String, Arc<SerialPortDriver>>,
    devices: Vec<ModbusDevice<SerialPortDriver>>,
}

impl PortRegistry {
    pub fn builder(config: AdapterConfig, factory: Arc<dyn SerialPortFactory>) -> PortRegistryBuilder {
        PortRegistryBuilder {
            config,
            factory,
            enumerator: None,
            executor: Arc::new(FunctionExecutor::new()),
            cleaner: Arc::new(NoopPortCleaner),
            metrics: Arc::new(NoopMetrics),
            options: DriverOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn driver(&self, port: &str) -> Option<&Arc<SerialPortDriver>> {
        self.drivers.get(port)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Arc<SerialPortDriver>> {
        self.drivers.values()
    }

    pub fn device(&self, name: &str) -> Option<&ModbusDevice<SerialPortDriver>> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn devices(&self) -> &[ModbusDevice<SerialPortDriver>] {
        &self.devices
    }

    /// Query `function` on the named device.
    pub async fn query(&self, device: &str, function: DeviceFunction) -> ModbusResult<DeviceResponse> {
        let device = self
            .device(device)
            .ok_or_else(|| ModbusError::invalid_argument(format!("unknown device {}", device)))?;
        device.query(function).await
    }

    /// Worst port health, with per-port details.
    pub fn health(&self) -> Health {
        let reports: Vec<(&str, Health)> = self
            .drivers
            .iter()
            .map(|(name, driver)| (name.as_str(), driver.health()))
            .collect();
        Health::aggregate(reports.iter().map(|(name, health)| (*name, health)))
    }

    /// Dispose every driver and wait for their supervisors.
    pub async fn shutdown(&self) {
        for driver in self.drivers.values() {
            driver.shutdown().await;
        }
        info!("port registry stopped");
    }
}
