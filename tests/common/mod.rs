//! Simulated meter bus shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll};

use serial_modbus_adapter::port::{
    PortEnumerator, PortEvent, PortEventListener, PortIo, SerialPortFactory, SerialPortHandle,
};
use serial_modbus_adapter::{CrcService, ModbusCrc, ModbusError, ModbusResult, SerialPortConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::Level;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .with_test_writer()
            .try_init();
    });
}

/// Register contents of one simulated meter: register -> 4 data bytes.
#[derive(Debug, Default, Clone)]
pub struct Meter {
    registers: HashMap<u8, [u8; 4]>,
}

impl Meter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_i32(mut self, register: u8, value: i32) -> Self {
        self.registers.insert(register, value.to_be_bytes());
        self
    }

    pub fn with_i16(mut self, register: u8, value: i16) -> Self {
        let [hi, lo] = value.to_be_bytes();
        self.registers.insert(register, [hi, lo, 0, 0]);
        self
    }
}

/// Shared state of one simulated port and the meters wired to it.
#[derive(Default)]
pub struct Bus {
    meters: Mutex<HashMap<u8, Meter>>,
    listener: Mutex<Option<PortEventListener>>,
    /// Responses still to be sent with a broken CRC
    corrupt: AtomicUsize,
    /// Open attempts still to be rejected as in use
    busy_opens: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub requests: Mutex<Vec<Vec<u8>>>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, device_id: u8, meter: Meter) {
        self.meters.lock().unwrap().insert(device_id, meter);
    }

    pub fn corrupt_next(&self, count: usize) {
        self.corrupt.store(count, Ordering::SeqCst);
    }

    pub fn reject_opens(&self, count: usize) {
        self.busy_opens.store(count, Ordering::SeqCst);
    }

    pub fn fire(&self, event: PortEvent) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Meter firmware: answer a read request, or stay silent.
    fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() != 8 || !ModbusCrc.check_crc(request) {
            return None;
        }
        let meters = self.meters.lock().unwrap();
        let meter = meters.get(&request[0])?;
        let data = meter.registers.get(&request[3])?;

        let mut frame = vec![request[0], request[1], 0x04];
        frame.extend_from_slice(data);
        frame.extend_from_slice(&[0, 0]);
        ModbusCrc.calculate_crc(&mut frame);

        if self
            .corrupt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            frame[8] ^= 0xFF;
        }
        Some(frame)
    }
}

/// Factory exposing one [`Bus`] per port name.
#[derive(Default)]
pub struct SimulatedFactory {
    buses: Mutex<HashMap<String, Arc<Bus>>>,
}

impl SimulatedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_port(&self, name: &str) -> Arc<Bus> {
        let bus = Bus::new();
        self.buses
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&bus));
        bus
    }
}

impl SerialPortFactory for SimulatedFactory {
    fn open(&self, name: &str) -> ModbusResult<Box<dyn SerialPortHandle>> {
        let bus = self
            .buses
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ModbusError::PortNotFound {
                port: name.to_string(),
            })?;
        bus.opens.fetch_add(1, Ordering::SeqCst);
        if bus
            .busy_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ModbusError::PortInUse {
                port: name.to_string(),
                message: "locked by another process".to_string(),
            });
        }
        Ok(Box::new(SimulatedHandle { bus }))
    }
}

impl PortEnumerator for SimulatedFactory {
    fn list_ports(&self) -> ModbusResult<Vec<String>> {
        Ok(self.buses.lock().unwrap().keys().cloned().collect())
    }
}

struct SimulatedHandle {
    bus: Arc<Bus>,
}

impl SerialPortHandle for SimulatedHandle {
    fn configure(&mut self, _config: &SerialPortConfig) -> ModbusResult<()> {
        Ok(())
    }

    fn io(&mut self) -> ModbusResult<Box<dyn PortIo>> {
        Ok(Box::new(SimulatedIo {
            bus: Arc::clone(&self.bus),
            inbox: VecDeque::new(),
        }))
    }

    fn add_event_listener(&mut self, listener: PortEventListener) -> ModbusResult<()> {
        *self.bus.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    fn remove_event_listener(&mut self) {
        self.bus.listener.lock().unwrap().take();
    }

    fn close(&mut self) {
        self.bus.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct SimulatedIo {
    bus: Arc<Bus>,
    inbox: VecDeque<u8>,
}

impl PortIo for SimulatedIo {
    fn bytes_available(&mut self) -> ModbusResult<usize> {
        Ok(self.inbox.len())
    }
}

impl AsyncRead for SimulatedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = buf.remaining().min(self.inbox.len());
        let bytes: Vec<u8> = self.inbox.drain(..n).collect();
        buf.put_slice(&bytes);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SimulatedIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.bus.requests.lock().unwrap().push(data.to_vec());
        if let Some(frame) = self.bus.answer(data) {
            self.inbox.extend(frame);
            self.bus.fire(PortEvent::DataAvailable {
                new: true,
                old: false,
            });
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
