//! Register addresses understood by the meters.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Single-byte register address on the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegisterId {
    TotalPower,
    ExportPower,
    ImportPower,
    CurrentPower,
    DeviceId,
    VoltagePhase1,
    VoltagePhase2,
    VoltagePhase3,
    AmperagePhase1,
    AmperagePhase2,
    AmperagePhase3,
}

impl RegisterId {
    pub const ALL: [RegisterId; 11] = [
        RegisterId::TotalPower,
        RegisterId::ExportPower,
        RegisterId::ImportPower,
        RegisterId::CurrentPower,
        RegisterId::DeviceId,
        RegisterId::VoltagePhase1,
        RegisterId::VoltagePhase2,
        RegisterId::VoltagePhase3,
        RegisterId::AmperagePhase1,
        RegisterId::AmperagePhase2,
        RegisterId::AmperagePhase3,
    ];

    /// Wire value placed in byte 3 of a request.
    #[inline]
    pub const fn value(self) -> u8 {
        match self {
            RegisterId::TotalPower => 0x00,
            RegisterId::ExportPower => 0x08,
            RegisterId::ImportPower => 0x0A,
            RegisterId::CurrentPower => 0x86,
            RegisterId::DeviceId => 0x15,
            RegisterId::VoltagePhase1 => 0x80,
            RegisterId::VoltagePhase2 => 0x81,
            RegisterId::VoltagePhase3 => 0x82,
            RegisterId::AmperagePhase1 => 0x83,
            RegisterId::AmperagePhase2 => 0x84,
            RegisterId::AmperagePhase3 => 0x85,
        }
    }

    /// Reverse lookup of [`RegisterId::value`].
    pub fn from_value(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.value() == value)
    }

    /// Energy counters read by the total-power function.
    pub const fn is_energy_counter(self) -> bool {
        matches!(
            self,
            RegisterId::TotalPower | RegisterId::ExportPower | RegisterId::ImportPower
        )
    }

    pub const fn is_voltage(self) -> bool {
        matches!(
            self,
            RegisterId::VoltagePhase1 | RegisterId::VoltagePhase2 | RegisterId::VoltagePhase3
        )
    }

    pub const fn is_amperage(self) -> bool {
        matches!(
            self,
            RegisterId::AmperagePhase1 | RegisterId::AmperagePhase2 | RegisterId::AmperagePhase3
        )
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.value())
    }
}
