//! CRC-16/Modbus computation and verification.
//!
//! The CRC occupies the last two bytes of every frame, low byte first.
//! Both operations treat everything before those two bytes as payload.

use crc::{Crc, CRC_16_MODBUS};

use crate::constants::CRC_SIZE;

/// Table-driven CRC-16/Modbus (poly 0xA001 reflected, init 0xFFFF).
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Computes and checks frame CRCs.
///
/// Implemented as a trait so function-layer tests can force the check
/// result without crafting valid frames.
pub trait CrcService: Send + Sync {
    /// Write the CRC of `buf[..len - 2]` into the last two bytes of `buf`.
    fn calculate_crc(&self, buf: &mut [u8]);

    /// Return true if the last two bytes of `buf` hold the CRC of the rest.
    fn check_crc(&self, buf: &[u8]) -> bool;
}

/// Default [`CrcService`] backed by the `crc` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusCrc;

impl ModbusCrc {
    pub fn new() -> Self {
        Self
    }

    /// CRC over an arbitrary payload.
    #[inline]
    pub fn checksum(payload: &[u8]) -> u16 {
        CRC_MODBUS.checksum(payload)
    }
}

impl CrcService for ModbusCrc {
    fn calculate_crc(&self, buf: &mut [u8]) {
        if buf.len() < CRC_SIZE {
            return;
        }
        let split = buf.len() - CRC_SIZE;
        let crc = Self::checksum(&buf[..split]);
        buf[split..].copy_from_slice(&crc.to_le_bytes());
    }

    fn check_crc(&self, buf: &[u8]) -> bool {
        if buf.len() < CRC_SIZE {
            return false;
        }
        let split = buf.len() - CRC_SIZE;
        let crc = Self::checksum(&buf[..split]);
        buf[split..] == crc.to_le_bytes()
    }
}
