//! Health reports for ports and devices.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Down,
    /// Not disposed but currently unusable; a reopen is pending.
    OutOfService,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Up => "UP",
            HealthStatus::Down => "DOWN",
            HealthStatus::OutOfService => "OUT_OF_SERVICE",
        };
        f.write_str(s)
    }
}

/// Status plus free-form details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl Health {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            details: BTreeMap::new(),
        }
    }

    pub fn up() -> Self {
        Self::new(HealthStatus::Up)
    }

    pub fn down() -> Self {
        Self::new(HealthStatus::Down)
    }

    pub fn out_of_service() -> Self {
        Self::new(HealthStatus::OutOfService)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }

    /// Worst status among `parts`; `Up` when empty.
    pub fn aggregate<'a>(parts: impl IntoIterator<Item = (&'a str, &'a Health)>) -> Self {
        let mut status = HealthStatus::Up;
        let mut details = BTreeMap::new();
        for (name, health) in parts {
            status = match (status, health.status) {
                (HealthStatus::Down, _) | (_, HealthStatus::Down) => HealthStatus::Down,
                (HealthStatus::OutOfService, _) | (_, HealthStatus::OutOfService) => {
                    HealthStatus::OutOfService
                }
                _ => HealthStatus::Up,
            };
            details.insert(name.to_string(), health.status.to_string());
        }
        Self { status, details }
    }
}
