//! # Adapter Configuration
//!
//! Plain data describing serial ports, the meters attached to them, and the
//! retry tunables of the driver and function layers. Types derive serde so an
//! external loader can produce them from any format; [`AdapterConfig::validate`]
//! checks the cross-references before anything is opened.
//!
//! ```rust
//! use serial_modbus_adapter::config::{SerialPortConfig, Parity, StopBits};
//!
//! let port = SerialPortConfig::new("ttyUSB0")
//!     .with_baud_rate(2400)
//!     .with_parity(Parity::Even)
//!     .with_stop_bits(StopBits::One);
//!
//! assert!(port.validate().is_ok());
//! assert_eq!(port.tick_ms(), 5);
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_RESPONSE_WAIT_MS, FUNCTION_DEADLINE, FUNCTION_MAX_RETRIES, FUNCTION_RETRY_DELAY,
    MAX_DATA_BITS, MIN_DATA_BITS, PORT_REOPEN_DELAY, SUPPORTED_BAUD_RATES,
};
use crate::device::DeviceFunction;
use crate::error::{ModbusError, ModbusResult};

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Serial stop bits setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "1.5")]
    OnePointFive,
}

impl StopBits {
    /// Bit times occupied by the stop bits.
    pub fn bit_time(self) -> f64 {
        match self {
            StopBits::One => 1.0,
            StopBits::Two => 2.0,
            StopBits::OnePointFive => 1.5,
        }
    }
}

fn default_response_wait_ms() -> u64 {
    DEFAULT_RESPONSE_WAIT_MS
}

/// Configuration of one physical serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortConfig {
    /// OS port name, also the unique id of the port
    pub name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Time to wait for the first response byte
    #[serde(default = "default_response_wait_ms")]
    pub response_wait_ms: u64,
}

impl SerialPortConfig {
    /// 9600 8N1 with the default response wait.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            response_wait_ms: DEFAULT_RESPONSE_WAIT_MS,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_response_wait_ms(mut self, response_wait_ms: u64) -> Self {
        self.response_wait_ms = response_wait_ms;
        self
    }

    pub fn response_wait(&self) -> Duration {
        Duration::from_millis(self.response_wait_ms)
    }

    /// Polling interval of the command handler in milliseconds.
    ///
    /// One character time (data + stop + start and parity allowance) plus one,
    /// truncated, never below 1.
    pub fn tick_ms(&self) -> u64 {
        let bits = f64::from(self.data_bits) + self.stop_bits.bit_time() + 2.0;
        let ms = bits * 1000.0 / f64::from(self.baud_rate.max(1)) + 1.0;
        (ms as u64).max(1)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms())
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModbusError::configuration("serial port name must not be empty"));
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ModbusError::configuration(format!(
                "{}: unsupported baud rate {} (allowed {:?})",
                self.name, self.baud_rate, SUPPORTED_BAUD_RATES
            )));
        }
        if !(MIN_DATA_BITS..=MAX_DATA_BITS).contains(&self.data_bits) {
            return Err(ModbusError::configuration(format!(
                "{}: data bits {} outside {}..={}",
                self.name, self.data_bits, MIN_DATA_BITS, MAX_DATA_BITS
            )));
        }
        if self.response_wait_ms == 0 {
            return Err(ModbusError::configuration(format!(
                "{}: response wait must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// A meter attached to a serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Modbus device address
    pub id: u8,
    pub name: String,
    /// Name of the [`SerialPortConfig`] the device is wired to
    pub serial_port: String,
    pub functions: Vec<DeviceFunction>,
}

impl DeviceConfig {
    pub fn new(id: u8, name: impl Into<String>, serial_port: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            serial_port: serial_port.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_function(mut self, function: DeviceFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_functions(mut self, functions: impl IntoIterator<Item = DeviceFunction>) -> Self {
        self.functions.extend(functions);
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.id < 1 {
            return Err(ModbusError::configuration(format!(
                "device {}: id must be at least 1",
                self.name
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ModbusError::configuration("device name must not be empty"));
        }
        if self.serial_port.trim().is_empty() {
            return Err(ModbusError::configuration(format!(
                "device {}: serial port must not be empty",
                self.name
            )));
        }
        if self.functions.is_empty() {
            return Err(ModbusError::configuration(format!(
                "device {}: at least one function is required",
                self.name
            )));
        }
        Ok(())
    }
}

/// Ports plus devices, as supplied by the configuration collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(default)]
    pub ports: Vec<SerialPortConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl AdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: SerialPortConfig) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    pub fn port(&self, name: &str) -> Option<&SerialPortConfig> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        let mut port_names = HashSet::new();
        for port in &self.ports {
            port.validate()?;
            if !port_names.insert(port.name.as_str()) {
                return Err(ModbusError::configuration(format!(
                    "duplicate serial port {}",
                    port.name
                )));
            }
        }

        let mut device_names = HashSet::new();
        let mut bus_addresses = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !device_names.insert(device.name.as_str()) {
                return Err(ModbusError::configuration(format!(
                    "duplicate device {}",
                    device.name
                )));
            }
            if !port_names.contains(device.serial_port.as_str()) {
                return Err(ModbusError::configuration(format!(
                    "device {} references unknown serial port {}",
                    device.name, device.serial_port
                )));
            }
            if !bus_addresses.insert((device.serial_port.as_str(), device.id)) {
                return Err(ModbusError::configuration(format!(
                    "device {}: id {} already used on {}",
                    device.name, device.id, device.serial_port
                )));
            }
        }
        Ok(())
    }
}

/// Retry policy of the function layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, protocol errors only
    pub max_retries: u32,
    pub delay: Duration,
    /// Deadline for the whole execution, retries included
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: FUNCTION_MAX_RETRIES,
            delay: FUNCTION_RETRY_DELAY,
            deadline: FUNCTION_DEADLINE,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Tunables of the serial port driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    /// Delay before each reopen attempt
    pub reopen_delay: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            reopen_delay: PORT_REOPEN_DELAY,
        }
    }
}

impl DriverOptions {
    pub fn with_reopen_delay(mut self, reopen_delay: Duration) -> Self {
        self.reopen_delay = reopen_delay;
        self
    }
}
