//! # Serial Modbus Adapter
//!
//! Multiplexes energy-meter register reads over a small number of shared
//! serial ports.
//!
//! ## Features
//!
//! - **Per-port command queue**: concurrent callers are serialized into one
//!   in-flight request per physical port, in submission order
//! - **Self-healing ports**: open failures and hardware faults are retried
//!   forever with a fixed delay; state is visible through health reports
//! - **Validated functions**: every response is CRC-16/Modbus checked and
//!   matched against the addressed device before decoding, with bounded
//!   retries on protocol errors
//! - **Pluggable backends**: ports, CRC, payload logging and metrics sit
//!   behind traits; the `rtu` feature provides a tokio-serial backend
//!
//! ## Supported Functions
//!
//! | Function | Register(s) | Value |
//! |----------|-------------|-------|
//! | ReadTotalPower | 0x00, 0x08, 0x0A | i32 / 100 (kWh) |
//! | ReadCurrentPower | 0x86 | i32 (W) |
//! | ReadCurrentVoltage | 0x80-0x82 | i16 / 10 (V) |
//! | ReadCurrentAmperage | 0x83-0x85 | i16 / 10 (A) |
//! | CheckState | 0x15 | device id byte |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "rtu")]
//! # async fn example() -> serial_modbus_adapter::ModbusResult<()> {
//! use std::sync::Arc;
//! use serial_modbus_adapter::{
//!     AdapterConfig, DeviceConfig, DeviceFunction, PortRegistry, SerialPortConfig,
//!     rtu::TokioSerialPortFactory,
//! };
//!
//! let config = AdapterConfig::new()
//!     .with_port(SerialPortConfig::new("/dev/ttyUSB0").with_baud_rate(9600))
//!     .with_device(
//!         DeviceConfig::new(1, "main-meter", "/dev/ttyUSB0")
//!             .with_functions([DeviceFunction::TotalPower, DeviceFunction::CurrentPower]),
//!     );
//!
//! let registry = PortRegistry::builder(config, Arc::new(TokioSerialPortFactory::new())).start()?;
//! let reading = registry.query("main-meter", DeviceFunction::TotalPower).await?;
//! println!("{} {}", reading.value, reading.unit);
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Frame sizes, function codes and timing constants
pub mod constants;

/// CRC-16/Modbus engine
pub mod crc;

/// Register addresses
pub mod register;

/// Request frame construction
pub mod frame;

/// Offset-based byte extraction and hex formatting
pub mod bytes;

/// Decoded value types
pub mod value;

// ============================================================================
// Port and command pipeline
// ============================================================================

/// Serial port collaborator traits
pub mod port;

/// Single-command request/response pipeline
pub mod handler;

/// Serial port driver and supervisor
pub mod driver;

/// tokio-serial backend
#[cfg(feature = "rtu")]
pub mod rtu;

// ============================================================================
// Application layer
// ============================================================================

/// Modbus function execution with retries
pub mod function;

/// Meter devices and the port registry
pub mod device;

/// Port, device and adapter configuration
pub mod config;

// ============================================================================
// Observability
// ============================================================================

/// Payload logging
pub mod logging;

/// Traffic counters and metrics sinks
pub mod metrics;

/// Health reports
pub mod health;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime ===
pub use tokio;

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Core types ===
pub use crc::{CrcService, ModbusCrc};
pub use frame::{FrameFormatter, FunctionArgs, ReadFormatter};
pub use register::RegisterId;
pub use value::ModbusValue;

// === Ports ===
pub use driver::{PortDriver, PortState, SerialPortDriver, SerialPortDriverBuilder};
pub use handler::{Command, CommandHandler, CommandResult, DataReadyFlag};
pub use port::{
    PortCleaner, PortEnumerator, PortEvent, PortEventListener, PortIo, SerialPortFactory,
    SerialPortHandle,
};

// === Functions and devices ===
pub use config::{
    AdapterConfig, DeviceConfig, DriverOptions, Parity, RetryPolicy, SerialPortConfig, StopBits,
};
pub use device::{DeviceFunction, DeviceResponse, ModbusDevice, PortRegistry};
pub use function::{FunctionExecutor, ModbusFunction};

// === Monitoring ===
pub use health::{Health, HealthStatus};
pub use logging::{CallbackLogger, CommunicationLogger, LogCallback, TracingCommunicationLogger};
pub use metrics::{InMemoryMetrics, MetricsSink, PortStats, PortStatsSnapshot};

#[cfg(feature = "rtu")]
pub use rtu::TokioSerialPortFactory;

/// Default deadline of one function execution (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Serial Modbus Adapter v{}", VERSION)
}
