//! # Frame Byte Helpers
//!
//! Offset-based big-endian extraction from raw response frames, and hex
//! rendering used by frame logging.
//!
//! The meters encode values big-endian starting at byte 3 (after device id,
//! function code and byte count):
//!
//! - 32-bit counter `[01 03 04 00 01 00 FF ..]` → `0x000100FF` = 65791
//! - 16-bit value  `[01 03 04 09 1B ..]` → `0x091B` = 2331

use std::fmt::Write;

use crate::error::{ModbusError, ModbusResult};

/// Offset of the first data byte in a read response.
pub const DATA_OFFSET: usize = 3;

fn slice_at<const N: usize>(buf: &[u8], offset: usize) -> ModbusResult<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(|| {
            ModbusError::invalid_data(format!(
                "need {} bytes at offset {}, frame has {}",
                N,
                offset,
                buf.len()
            ))
        })
}

/// Read a big-endian i32 at `offset`.
///
/// # Example
///
/// ```rust
/// use serial_modbus_adapter::bytes::be_i32_at;
///
/// let frame = [0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF];
/// assert_eq!(be_i32_at(&frame, 3).unwrap(), 65791);
/// ```
#[inline]
pub fn be_i32_at(buf: &[u8], offset: usize) -> ModbusResult<i32> {
    slice_at::<4>(buf, offset).map(i32::from_be_bytes)
}

/// Read a big-endian i16 at `offset`.
#[inline]
pub fn be_i16_at(buf: &[u8], offset: usize) -> ModbusResult<i16> {
    slice_at::<2>(buf, offset).map(i16::from_be_bytes)
}

/// Read a single byte at `offset`.
#[inline]
pub fn u8_at(buf: &[u8], offset: usize) -> ModbusResult<u8> {
    slice_at::<1>(buf, offset).map(|[b]| b)
}

/// Render bytes as space-separated uppercase hex, e.g. `01 03 00 86`.
pub fn format_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}
