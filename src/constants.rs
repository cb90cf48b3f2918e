//! Protocol and timing constants for the serial meter protocol.
//!
//! The wire format is a fixed-layout subset of Modbus RTU: an 8-byte read
//! request and a 9-byte response, both terminated by CRC-16/Modbus.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Request frame length: 6 header bytes + 2 CRC bytes
pub const REQUEST_FRAME_SIZE: usize = 8;

/// Response frame length for every supported function
///
/// Layout: Device ID(1) + Function(1) + Byte Count(1) + Data(4) + CRC(2)
pub const RESPONSE_FRAME_SIZE: usize = 9;

/// Trailing CRC length on every frame
pub const CRC_SIZE: usize = 2;

/// Placeholder written into formatter-owned bytes before formatting
pub const FRAME_SENTINEL: u8 = 0xFF;

/// Upper bound on bytes accumulated for one response
pub const MAX_RESPONSE_BUFFER_SIZE: usize = 256;

/// Initial capacity of the per-command receive buffer
pub const RECEIVE_BUFFER_SIZE: usize = 128;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Word count requested by every read (one 32-bit value)
pub const READ_WORD_COUNT: u16 = 2;

// ============================================================================
// Timing
// ============================================================================

/// Default time to wait for the first response byte
pub const DEFAULT_RESPONSE_WAIT_MS: u64 = 2000;

/// Consecutive empty polls that mark the end of a response
pub const IDLE_POLLS: u32 = 10;

/// Delay between attempts to (re)open a port
pub const PORT_REOPEN_DELAY: Duration = Duration::from_secs(5);

/// Protocol-error retries after the first attempt
pub const FUNCTION_MAX_RETRIES: u32 = 2;

/// Delay between protocol-error retries
pub const FUNCTION_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Overall deadline for one function execution, retries included
pub const FUNCTION_DEADLINE: Duration = Duration::from_secs(5);

// ============================================================================
// Serial Line Parameters
// ============================================================================

/// Baud rates the meters support
pub const SUPPORTED_BAUD_RATES: [u32; 4] = [1200, 2400, 4800, 9600];

/// Allowed data bits range
pub const MIN_DATA_BITS: u8 = 5;
pub const MAX_DATA_BITS: u8 = 8;
