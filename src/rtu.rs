//! tokio-serial backed port factory.
//!
//! Ports are opened as [`SerialStream`]s, tokio-serial's reactor-driven
//! stream, so request writes and response reads never park a runtime worker.
//! serialport has no event callbacks: data arrival is picked up by the
//! command handler sampling the input queue each tick, and the stream
//! reports [`PortEvent::HardwareError`] itself when a read or write fails at
//! the OS level.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{
    ClearBuffer, DataBits, ErrorKind, Parity, SerialPort, SerialStream, StopBits,
};
use tracing::{debug, warn};

use crate::config::{self, SerialPortConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::port::{
    PortEnumerator, PortEvent, PortEventListener, PortIo, SerialPortFactory, SerialPortHandle,
};

type SharedListener = Arc<Mutex<Option<PortEventListener>>>;

/// Opens OS serial ports with tokio-serial.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialPortFactory;

impl TokioSerialPortFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SerialPortFactory for TokioSerialPortFactory {
    fn open(&self, name: &str) -> ModbusResult<Box<dyn SerialPortHandle>> {
        // Line parameters are applied by `configure`
        let builder = tokio_serial::new(name, 9600);
        let stream = SerialStream::open(&builder).map_err(|e| map_open_error(name, e))?;
        debug!(port = %name, "serial port opened");
        Ok(Box::new(TokioSerialHandle {
            name: name.to_string(),
            stream: Some(stream),
            listener: Arc::new(Mutex::new(None)),
        }))
    }
}

impl PortEnumerator for TokioSerialPortFactory {
    fn list_ports(&self) -> ModbusResult<Vec<String>> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

/// Open port. The stream moves to the command handler on [`io`](SerialPortHandle::io)
/// and is released when the handler stops.
struct TokioSerialHandle {
    name: String,
    stream: Option<SerialStream>,
    listener: SharedListener,
}

impl SerialPortHandle for TokioSerialHandle {
    fn configure(&mut self, config: &SerialPortConfig) -> ModbusResult<()> {
        if config.stop_bits == config::StopBits::OnePointFive {
            warn!(port = %self.name, "1.5 stop bits unsupported by the serial backend, using 2");
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection(format!("{} is not open", self.name)))?;
        stream.set_baud_rate(config.baud_rate)?;
        stream.set_data_bits(map_data_bits(config.data_bits)?)?;
        stream.set_parity(map_parity(config.parity))?;
        stream.set_stop_bits(map_stop_bits(config.stop_bits))?;
        stream.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn io(&mut self) -> ModbusResult<Box<dyn PortIo>> {
        let stream = self.stream.take().ok_or_else(|| {
            ModbusError::connection(format!("{} stream already in use or closed", self.name))
        })?;
        Ok(Box::new(SerialIo {
            name: self.name.clone(),
            stream,
            listener: Arc::clone(&self.listener),
        }))
    }

    fn add_event_listener(&mut self, listener: PortEventListener) -> ModbusResult<()> {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
        Ok(())
    }

    fn remove_event_listener(&mut self) {
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
    }

    fn close(&mut self) {
        self.remove_event_listener();
        self.stream = None;
        debug!(port = %self.name, "serial port closed");
    }
}

impl Drop for TokioSerialHandle {
    fn drop(&mut self) {
        self.remove_event_listener();
    }
}

/// Stream handed to the command handler.
struct SerialIo {
    name: String,
    stream: SerialStream,
    listener: SharedListener,
}

impl SerialIo {
    fn report_fault(&self, err: &io::Error) {
        if !is_hardware_fault(err) {
            return;
        }
        let listener = self.listener.lock().ok().and_then(|slot| slot.clone());
        if let Some(listener) = listener {
            warn!(port = %self.name, error = %err, "serial stream fault");
            listener(PortEvent::HardwareError(err.to_string()));
        }
    }

    fn observe<T>(&self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(e)) = &poll {
            self.report_fault(e);
        }
        poll
    }
}

impl PortIo for SerialIo {
    fn bytes_available(&mut self) -> ModbusResult<usize> {
        match self.stream.bytes_to_read() {
            Ok(count) => Ok(count as usize),
            Err(e) => {
                let err = ModbusError::from(e);
                if let Some(listener) = self.listener.lock().ok().and_then(|slot| slot.clone()) {
                    listener(PortEvent::HardwareError(err.to_string()));
                }
                Err(err)
            }
        }
    }
}

impl AsyncRead for SerialIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_read(cx, buf);
        this.observe(poll)
    }
}

impl AsyncWrite for SerialIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_write(cx, data);
        this.observe(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_flush(cx);
        this.observe(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_shutdown(cx);
        this.observe(poll)
    }
}

// ============================================================================
// Parameter and error mapping
// ============================================================================

fn map_data_bits(bits: u8) -> ModbusResult<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(ModbusError::configuration(format!(
            "unsupported data bits {}",
            other
        ))),
    }
}

/// serialport has no mark/space parity; both fall back to none.
fn map_parity(parity: config::Parity) -> Parity {
    match parity {
        config::Parity::Odd => Parity::Odd,
        config::Parity::Even => Parity::Even,
        config::Parity::None | config::Parity::Mark | config::Parity::Space => Parity::None,
    }
}

fn map_stop_bits(stop_bits: config::StopBits) -> StopBits {
    match stop_bits {
        config::StopBits::One => StopBits::One,
        config::StopBits::Two | config::StopBits::OnePointFive => StopBits::Two,
    }
}

fn map_open_error(name: &str, err: tokio_serial::Error) -> ModbusError {
    use std::io::ErrorKind as IoKind;

    match err.kind() {
        ErrorKind::NoDevice | ErrorKind::Io(IoKind::NotFound) => ModbusError::PortNotFound {
            port: name.to_string(),
        },
        ErrorKind::Io(IoKind::PermissionDenied) | ErrorKind::Io(IoKind::ResourceBusy) => {
            ModbusError::PortInUse {
                port: name.to_string(),
                message: err.description,
            }
        }
        _ => ModbusError::connection(format!("{}: {}", name, err.description)),
    }
}

/// Stream errors that mean the device went away rather than one bad exchange.
fn is_hardware_fault(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            ErrorKind::Io(kind) => std::io::Error::new(kind, err.description).into(),
            ErrorKind::InvalidInput => ModbusError::configuration(err.description),
            _ => ModbusError::connection(err.description),
        }
    }
}
