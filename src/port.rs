//! Physical serial port seams.
//!
//! The driver never touches an OS port directly. It opens ports through a
//! [`SerialPortFactory`], talks bytes through [`PortIo`], and learns about
//! incoming data and hardware faults from [`PortEvent`]s pushed into the
//! listener it registers. The `rtu` feature provides the tokio-serial
//! implementation; tests substitute simulated meters.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::SerialPortConfig;
use crate::error::ModbusResult;

/// Byte stream of an open port.
///
/// Reads and writes go through tokio's async I/O traits so a slow line never
/// holds a runtime worker. `bytes_available` answers from what is already
/// buffered and must not wait.
pub trait PortIo: AsyncRead + AsyncWrite + Unpin + Send {
    fn bytes_available(&mut self) -> ModbusResult<usize>;
}

/// Out-of-band notification from the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Data-available line changed from `old` to `new`.
    DataAvailable { new: bool, old: bool },
    /// The port reported a fault and must be reopened.
    HardwareError(String),
}

/// Callback registered on an open port.
pub type PortEventListener = Arc<dyn Fn(PortEvent) + Send + Sync>;

/// An opened, not yet necessarily configured, serial port.
pub trait SerialPortHandle: Send {
    /// Apply baud rate, data bits, stop bits and parity.
    fn configure(&mut self, config: &SerialPortConfig) -> ModbusResult<()>;

    /// Stream used by the command handler.
    fn io(&mut self) -> ModbusResult<Box<dyn PortIo>>;

    fn add_event_listener(&mut self, listener: PortEventListener) -> ModbusResult<()>;

    fn remove_event_listener(&mut self);

    fn close(&mut self);
}

/// Opens ports by name.
///
/// `open` and [`SerialPortHandle::configure`] may block briefly on the OS;
/// the driver runs them on tokio's blocking pool. Fails with `PortNotFound`
/// or `PortInUse` where the cause is known.
pub trait SerialPortFactory: Send + Sync {
    fn open(&self, name: &str) -> ModbusResult<Box<dyn SerialPortHandle>>;
}

/// Lists port names present on the host.
pub trait PortEnumerator: Send + Sync {
    fn list_ports(&self) -> ModbusResult<Vec<String>>;
}

/// Hook invoked after a port is torn down because of a hardware fault
/// or external cancellation, e.g. to reset a USB adapter.
pub trait PortCleaner: Send + Sync {
    fn clean(&self, port_name: &str);
}

impl<F> PortCleaner for F
where
    F: Fn(&str) + Send + Sync,
{
    fn clean(&self, port_name: &str) {
        self(port_name)
    }
}

/// Cleaner that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPortCleaner;

impl PortCleaner for NoopPortCleaner {
    fn clean(&self, _port_name: &str) {}
}

impl fmt::Display for PortEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortEvent::DataAvailable { new, old } => write!(f, "data available {} -> {}", old, new),
            PortEvent::HardwareError(message) => write!(f, "hardware error: {}", message),
        }
    }
}
