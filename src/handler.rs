//! Single-command request/response pipeline of one serial port.
//!
//! The handler owns the port's byte stream and processes one [`Command`] at a
//! time:
//!
//! 1. drain bytes left over from earlier exchanges and clear the data-ready flag
//! 2. write the request
//! 3. poll the data-ready flag once per tick until it is set or the response
//!    wait elapses (timeout, no partial data)
//! 4. read whatever is buffered, restarting the idle count whenever bytes
//!    arrive, and stop after [`IDLE_POLLS`] consecutive empty polls or once
//!    [`MAX_RESPONSE_BUFFER_SIZE`] bytes are held
//!
//! Each tick of step 3 also samples the port's input queue, so backends that
//! never raise data events are still served.
//!
//! The data-ready flag is written by the port's event listener from any
//! thread and read by the polling loop; it is the only shared mutable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bytes::format_hex;
use crate::config::SerialPortConfig;
use crate::constants::{IDLE_POLLS, MAX_RESPONSE_BUFFER_SIZE, RECEIVE_BUFFER_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::metrics::{MetricsSink, NoopMetrics, PortStats};
use crate::port::PortIo;

/// Outcome of one command; exactly one of data or error.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub id: u64,
    pub outcome: ModbusResult<Vec<u8>>,
}

impl CommandResult {
    pub fn data(&self) -> Option<&[u8]> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&ModbusError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> ModbusResult<Vec<u8>> {
        self.outcome
    }
}

/// A request queued for a port, with the channel its result goes to.
#[derive(Debug)]
pub struct Command {
    pub id: u64,
    pub request: Vec<u8>,
    result_tx: oneshot::Sender<CommandResult>,
}

impl Command {
    pub fn new(id: u64, request: Vec<u8>) -> (Self, oneshot::Receiver<CommandResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        (
            Self {
                id,
                request,
                result_tx,
            },
            result_rx,
        )
    }

    /// Deliver the result. Consumes the command, so this happens once.
    pub fn complete(self, outcome: ModbusResult<Vec<u8>>) {
        let result = CommandResult {
            id: self.id,
            outcome,
        };
        // Receiver gone means the caller stopped waiting
        let _ = self.result_tx.send(result);
    }
}

/// Data-available flag shared between the port listener and the handler.
#[derive(Debug, Clone, Default)]
pub struct DataReadyFlag(Arc<AtomicBool>);

impl DataReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a data-available transition reported by the port.
    pub fn notify_new_data_available(&self, new: bool, old: bool) {
        if new != old {
            trace!("data available changed {} -> {}", old, new);
        }
        self.0.store(new, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.set(false);
    }
}

/// Executes commands against one port's byte stream.
pub struct CommandHandler {
    port_name: String,
    io: Box<dyn PortIo>,
    data_ready: DataReadyFlag,
    tick: Duration,
    response_wait: Duration,
    stats: Arc<PortStats>,
    metrics: Arc<dyn MetricsSink>,
}

impl CommandHandler {
    pub fn new(config: &SerialPortConfig, io: Box<dyn PortIo>, data_ready: DataReadyFlag) -> Self {
        Self {
            port_name: config.name.clone(),
            io,
            data_ready,
            tick: config.tick(),
            response_wait: config.response_wait(),
            stats: Arc::new(PortStats::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_stats(mut self, stats: Arc<PortStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Process commands in arrival order until cancelled or the queue closes.
    ///
    /// Commands still queued at shutdown are failed with `NotRunning`.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        debug!(port = %self.port_name, "command handler started");
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.process(command).await;
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            let id = command.id;
            command.complete(Err(ModbusError::not_running(&self.port_name, id)));
        }
        debug!(port = %self.port_name, "command handler stopped");
    }

    /// Run one command through the pipeline and complete its channel.
    pub async fn process(&mut self, command: Command) {
        let started = Instant::now();
        let id = command.id;
        let outcome = self.exchange(&command.request).await;
        self.data_ready.clear();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(data) => debug!(
                port = %self.port_name,
                command_id = id,
                elapsed_ms,
                "command {} request/reply completed in {} ms ({} bytes)",
                id,
                elapsed_ms,
                data.len()
            ),
            Err(e) => {
                self.stats.record_error();
                warn!(
                    port = %self.port_name,
                    command_id = id,
                    elapsed_ms,
                    error = %e,
                    "command {} failed after {} ms",
                    id,
                    elapsed_ms
                );
            }
        }
        command.complete(outcome);
    }

    async fn exchange(&mut self, request: &[u8]) -> ModbusResult<Vec<u8>> {
        self.drain().await?;
        self.write(request).await?;
        self.wait_for_data().await?;
        self.read_data().await
    }

    /// Read bytes the port reported as buffered. A read that is not ready
    /// within one tick yields nothing.
    async fn read_buffered(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        match timeout(self.tick, self.io.read(buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Ok(0),
        }
    }

    async fn drain(&mut self) -> ModbusResult<()> {
        let mut scratch = [0u8; RECEIVE_BUFFER_SIZE];
        let mut drained = 0usize;
        loop {
            let available = self.io.bytes_available()?;
            if available == 0 {
                break;
            }
            let n = self
                .read_buffered(&mut scratch[..available.min(RECEIVE_BUFFER_SIZE)])
                .await?;
            if n == 0 {
                break;
            }
            drained += n;
        }
        if drained > 0 {
            debug!(port = %self.port_name, "drained {} stale bytes", drained);
        }
        self.data_ready.clear();
        Ok(())
    }

    async fn write(&mut self, request: &[u8]) -> ModbusResult<()> {
        trace!(port = %self.port_name, "write [{}]", format_hex(request));
        let wait = self.response_wait;
        let io = &mut self.io;
        let sent = async move {
            io.write_all(request).await?;
            io.flush().await
        };
        let outcome = timeout(wait, sent).await;
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                self.stats.record_timeout();
                return Err(ModbusError::timeout(
                    format!("{} - write request", self.port_name),
                    wait.as_millis() as u64,
                ));
            }
        }
        self.stats.record_sent(request.len());
        self.metrics.bytes_written(&self.port_name, request.len());
        Ok(())
    }

    async fn wait_for_data(&mut self) -> ModbusResult<()> {
        let tick_ms = self.tick.as_millis() as i64;
        let mut remaining = self.response_wait.as_millis() as i64;
        while remaining >= 0 {
            if self.data_ready.is_set() {
                return Ok(());
            }
            // Backends without data events are sampled directly
            if self.io.bytes_available()? > 0 {
                self.data_ready.notify_new_data_available(true, false);
                return Ok(());
            }
            sleep(self.tick).await;
            remaining -= tick_ms;
        }
        if self.data_ready.is_set() {
            return Ok(());
        }
        self.stats.record_timeout();
        Err(ModbusError::timeout(
            format!("{} - did not receive any data", self.port_name),
            self.response_wait.as_millis() as u64,
        ))
    }

    async fn read_data(&mut self) -> ModbusResult<Vec<u8>> {
        let mut buffer = BytesMut::with_capacity(RECEIVE_BUFFER_SIZE);
        let mut chunk = [0u8; RECEIVE_BUFFER_SIZE];
        let mut idle = IDLE_POLLS;

        while idle > 0 {
            let room = MAX_RESPONSE_BUFFER_SIZE - buffer.len();
            if room == 0 {
                debug!(
                    port = %self.port_name,
                    "response reached {} bytes, ignoring the rest",
                    MAX_RESPONSE_BUFFER_SIZE
                );
                break;
            }
            let available = self.io.bytes_available()?;
            let n = if available > 0 {
                let want = available.min(RECEIVE_BUFFER_SIZE).min(room);
                self.read_buffered(&mut chunk[..want]).await?
            } else {
                0
            };
            if n > 0 {
                buffer.extend_from_slice(&chunk[..n]);
                idle = IDLE_POLLS;
            } else {
                idle -= 1;
            }
            sleep(self.tick).await;
        }

        self.stats.record_received(buffer.len());
        self.metrics.bytes_read(&self.port_name, buffer.len());
        trace!(port = %self.port_name, "read [{}]", format_hex(&buffer));
        Ok(buffer.to_vec())
    }
}
