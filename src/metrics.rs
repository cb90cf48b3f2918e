//! Counters reported by ports and functions.
//!
//! The adapter only emits measurements; exporting them is the job of
//! whatever [`MetricsSink`] the application installs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Receiver of adapter measurements. Calls are fire-and-forget.
pub trait MetricsSink: Send + Sync {
    fn bytes_written(&self, port: &str, count: usize);
    fn bytes_read(&self, port: &str, count: usize);
    fn port_running(&self, port: &str, running: bool);
    fn function_completed(&self, function: &str, success: bool);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn bytes_written(&self, _port: &str, _count: usize) {}
    fn bytes_read(&self, _port: &str, _count: usize) {}
    fn port_running(&self, _port: &str, _running: bool) {}
    fn function_completed(&self, _function: &str, _success: bool) {}
}

/// Lock-free traffic counters of one port.
#[derive(Debug, Default)]
pub struct PortStats {
    commands_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time copy of [`PortStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub commands_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl PortStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortTotals {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub running: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FunctionTotals {
    pub succeeded: u64,
    pub failed: u64,
}

/// In-process sink keeping totals per port and per function.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    ports: Mutex<HashMap<String, PortTotals>>,
    functions: Mutex<HashMap<String, FunctionTotals>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self, port: &str) -> PortTotals {
        self.ports
            .lock()
            .map(|m| m.get(port).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn function(&self, function: &str) -> FunctionTotals {
        self.functions
            .lock()
            .map(|m| m.get(function).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn update_port(&self, port: &str, f: impl FnOnce(&mut PortTotals)) {
        if let Ok(mut ports) = self.ports.lock() {
            f(ports.entry(port.to_string()).or_default());
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn bytes_written(&self, port: &str, count: usize) {
        self.update_port(port, |t| t.bytes_written += count as u64);
    }

    fn bytes_read(&self, port: &str, count: usize) {
        self.update_port(port, |t| t.bytes_read += count as u64);
    }

    fn port_running(&self, port: &str, running: bool) {
        self.update_port(port, |t| t.running = running);
    }

    fn function_completed(&self, function: &str, success: bool) {
        if let Ok(mut functions) = self.functions.lock() {
            let totals = functions.entry(function.to_string()).or_default();
            if success {
                totals.succeeded += 1;
            } else {
                totals.failed += 1;
            }
        }
    }
}
