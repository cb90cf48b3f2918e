//! Request frame construction.
//!
//! Every request is an 8-byte frame:
//!
//! | Byte | Content |
//! |------|---------|
//! | 0 | device id |
//! | 1 | operation type (formatter) |
//! | 2 | 0x00 |
//! | 3 | register id |
//! | 4-5 | word count (formatter) |
//! | 6-7 | CRC, low byte first |
//!
//! Bytes 1, 4 and 5 are seeded with [`FRAME_SENTINEL`] and must be overwritten
//! by the [`FrameFormatter`]; a frame that still carries the sentinel is a
//! configuration error and never reaches the wire.

use std::fmt;

use tracing::debug;

use crate::bytes::format_hex;
use crate::constants::{FC_READ_HOLDING_REGISTERS, FRAME_SENTINEL, READ_WORD_COUNT, REQUEST_FRAME_SIZE};
use crate::driver::PortDriver;
use crate::error::{ModbusError, ModbusResult};
use crate::register::RegisterId;

/// Byte offsets owned by the formatter.
const FORMATTER_OWNED: [usize; 3] = [1, 4, 5];

/// Fills the operation-specific bytes of a request frame.
pub trait FrameFormatter: Send + Sync {
    fn format(&self, frame: &mut [u8]);
}

/// Read-holding-registers formatter: FC03, two words.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFormatter;

impl FrameFormatter for ReadFormatter {
    fn format(&self, frame: &mut [u8]) {
        let [hi, lo] = READ_WORD_COUNT.to_be_bytes();
        frame[1] = FC_READ_HOLDING_REGISTERS;
        frame[4] = hi;
        frame[5] = lo;
    }
}

/// Arguments of one function invocation: target port, device and register.
pub struct FunctionArgs<'a, D: PortDriver> {
    driver: &'a D,
    device_id: u8,
    register_id: RegisterId,
    request_size: usize,
    formatter: Box<dyn FrameFormatter>,
}

impl<'a, D: PortDriver> FunctionArgs<'a, D> {
    /// Arguments with a custom formatter and request size.
    pub fn new(
        driver: &'a D,
        device_id: u8,
        register_id: RegisterId,
        request_size: usize,
        formatter: Box<dyn FrameFormatter>,
    ) -> Self {
        Self {
            driver,
            device_id,
            register_id,
            request_size,
            formatter,
        }
    }

    fn read(driver: &'a D, device_id: u8, register_id: RegisterId) -> Self {
        Self::new(
            driver,
            device_id,
            register_id,
            REQUEST_FRAME_SIZE,
            Box::new(ReadFormatter),
        )
    }

    /// Energy counter read; accepts total, export and import registers only.
    pub fn read_total_power(
        driver: &'a D,
        device_id: u8,
        register_id: RegisterId,
    ) -> ModbusResult<Self> {
        if !register_id.is_energy_counter() {
            return Err(ModbusError::invalid_argument(format!(
                "register {} does not belong to total power",
                register_id
            )));
        }
        Ok(Self::read(driver, device_id, register_id))
    }

    pub fn read_current_power(driver: &'a D, device_id: u8) -> Self {
        Self::read(driver, device_id, RegisterId::CurrentPower)
    }

    pub fn read_current_voltage(
        driver: &'a D,
        device_id: u8,
        register_id: RegisterId,
    ) -> ModbusResult<Self> {
        if !register_id.is_voltage() {
            return Err(ModbusError::invalid_argument(format!(
                "register {} is not a voltage phase",
                register_id
            )));
        }
        Ok(Self::read(driver, device_id, register_id))
    }

    pub fn read_current_amperage(
        driver: &'a D,
        device_id: u8,
        register_id: RegisterId,
    ) -> ModbusResult<Self> {
        if !register_id.is_amperage() {
            return Err(ModbusError::invalid_argument(format!(
                "register {} is not an amperage phase",
                register_id
            )));
        }
        Ok(Self::read(driver, device_id, register_id))
    }

    /// Device id read used as a liveness check.
    pub fn check_state(driver: &'a D, device_id: u8) -> Self {
        Self::read(driver, device_id, RegisterId::DeviceId)
    }

    pub fn driver(&self) -> &'a D {
        self.driver
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn register_id(&self) -> RegisterId {
        self.register_id
    }

    pub fn request_size(&self) -> usize {
        self.request_size
    }

    /// Build the request frame, then hand it to `on_crc_ready` to append the CRC.
    pub fn to_message<F>(&self, on_crc_ready: F) -> ModbusResult<Vec<u8>>
    where
        F: FnOnce(&mut [u8]),
    {
        if self.request_size < REQUEST_FRAME_SIZE {
            return Err(ModbusError::configuration(format!(
                "request size {} is below the minimum frame size {}",
                self.request_size, REQUEST_FRAME_SIZE
            )));
        }

        let mut frame = vec![0u8; self.request_size];
        frame[0] = self.device_id;
        frame[2] = 0x00;
        frame[3] = self.register_id.value();
        for i in FORMATTER_OWNED {
            frame[i] = FRAME_SENTINEL;
        }

        self.formatter.format(&mut frame);

        if let Some(i) = FORMATTER_OWNED.iter().find(|&&i| frame[i] == FRAME_SENTINEL) {
            return Err(ModbusError::configuration(format!(
                "frame byte {} was not set by the formatter",
                i
            )));
        }

        on_crc_ready(&mut frame);
        debug!(
            port = %self.driver.name(),
            "Request frame for {}: {}",
            self,
            format_hex(&frame)
        );
        Ok(frame)
    }

    /// True if the response was sent by the addressed device.
    pub fn response_device_matches(&self, response: &[u8]) -> bool {
        response.len() > 1 && response[0] == self.device_id
    }
}

impl<D: PortDriver> fmt::Display for FunctionArgs<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device_id, self.register_id)
    }
}

impl<D: PortDriver> fmt::Debug for FunctionArgs<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionArgs")
            .field("port", &self.driver.name())
            .field("device_id", &self.device_id)
            .field("register_id", &self.register_id)
            .field("request_size", &self.request_size)
            .finish()
    }
}
