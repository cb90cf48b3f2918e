//! Error types for the serial Modbus adapter.
//!
//! Errors fall into five families which drive the retry behaviour of the
//! layers above them:
//!
//! | Family | Variants | Handling |
//! |--------|----------|----------|
//! | Configuration | `Configuration`, `InvalidArgument` | fatal, never retried |
//! | Transport | `PortNotFound`, `PortInUse`, `HardwareError`, `NotRunning`, `Connection` | port supervisor reopens forever |
//! | Protocol | `CrcCheck`, `DeviceIdMismatch` | bounded retry in the function layer |
//! | Timeout | `Timeout` | surfaced to the caller |
//! | I/O | `Io`, `InvalidData`, `Protocol` | fails the current command only |

use thiserror::Error;

/// Result type used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by ports, command handlers and Modbus functions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Underlying stream read or write failed
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic connection failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation did not complete in time
    #[error("Timeout: {operation} did not complete in {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed frame or unexpected protocol state
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Response too short or otherwise undecodable
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Invalid configuration or frame layout
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Caller supplied an argument the operation does not accept
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// CRC of an incoming message did not match its payload
    #[error("CRC check failed on incoming message")]
    CrcCheck,

    /// Response came from a different device than the request addressed
    #[error("Device ID check failed: expected {expected}, got {actual}")]
    DeviceIdMismatch { expected: u8, actual: u8 },

    /// Command submitted while the port is closed
    #[error("{port} - failed to schedule command {command_id} - port not initialized")]
    NotRunning { port: String, command_id: u64 },

    /// Named serial port does not exist
    #[error("serial port {port} not found")]
    PortNotFound { port: String },

    /// Named serial port is held by another process
    #[error("serial port is in use - {message}")]
    PortInUse { port: String, message: String },

    /// Hardware reported a fault on an open port
    #[error("hardware error on {port}: {message}")]
    HardwareError { port: String, message: String },

    /// A retryable failure persisted through every allowed attempt
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ModbusError>,
    },
}

impl ModbusError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_running(port: impl Into<String>, command_id: u64) -> Self {
        Self::NotRunning {
            port: port.into(),
            command_id,
        }
    }

    pub fn hardware(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HardwareError {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Protocol-level failures that the function layer retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CrcCheck | Self::DeviceIdMismatch { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout { .. })
    }

    /// Failures that mean the port itself is unusable until reopened.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::PortNotFound { .. }
                | Self::PortInUse { .. }
                | Self::HardwareError { .. }
                | Self::NotRunning { .. }
                | Self::Connection { .. }
        )
    }

    /// Innermost error, looking through `RetriesExhausted`.
    pub fn root_cause(&self) -> &ModbusError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(err.to_string(), 0),
            _ => Self::io(err.to_string()),
        }
    }
}
