//! # Modbus Value Types
//!
//! Decoded results of meter functions. Measurements are scaled floats;
//! the state check yields the raw device id byte.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value produced by a [`ModbusFunction`](crate::function::ModbusFunction).
///
/// # Example
///
/// ```rust
/// use serial_modbus_adapter::ModbusValue;
///
/// let power = ModbusValue::F32(657.91);
/// assert!((power.as_f64() - 657.91).abs() < 0.001);
/// assert_eq!(power.type_name(), "f32");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModbusValue {
    /// Scaled measurement (kWh, W, V, A)
    F32(f32),
    /// Raw byte (device id)
    U8(u8),
}

impl ModbusValue {
    /// Convert the value to f64 for uniform numeric handling.
    #[inline]
    pub fn as_f64(&self) -> f64 {
        match self {
            ModbusValue::F32(v) => f64::from(*v),
            ModbusValue::U8(v) => f64::from(*v),
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ModbusValue::F32(v) => Some(*v),
            ModbusValue::U8(_) => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            ModbusValue::U8(v) => Some(*v),
            ModbusValue::F32(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ModbusValue::F32(_) => "f32",
            ModbusValue::U8(_) => "u8",
        }
    }
}

impl fmt::Display for ModbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusValue::F32(v) => write!(f, "{}", v),
            ModbusValue::U8(v) => write!(f, "{}", v),
        }
    }
}

impl From<f32> for ModbusValue {
    fn from(v: f32) -> Self {
        ModbusValue::F32(v)
    }
}

impl From<u8> for ModbusValue {
    fn from(v: u8) -> Self {
        ModbusValue::U8(v)
    }
}
