//! Serial port driver: lifecycle supervision and command serialization.
//!
//! Each [`SerialPortDriver`] owns one physical port. A supervisor task opens
//! and configures it through the [`SerialPortFactory`], then runs a
//! [`CommandHandler`] fed by an unbounded FIFO queue so that concurrent
//! [`PortDriver::communicate`] calls reach the wire one at a time.
//!
//! ```text
//! Closed -> Opening -> Running -> Closed            (external cancellation)
//!                         |   \-> Disposed          (dispose)
//!                         \-> Faulted -> Opening    (hardware error, after delay)
//!           Opening -> Faulted -> Opening           (open failure, after delay)
//! ```
//!
//! Open failures and hardware faults are retried forever with a fixed delay;
//! the reason is kept as the port's last error and reported through
//! [`SerialPortDriver::health`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DriverOptions, SerialPortConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::handler::{Command, CommandHandler, DataReadyFlag};
use crate::health::Health;
use crate::metrics::{MetricsSink, NoopMetrics, PortStats, PortStatsSnapshot};
use crate::port::{
    NoopPortCleaner, PortCleaner, PortEvent, PortEventListener, SerialPortFactory,
    SerialPortHandle,
};

/// Multiple of the response wait granted to an in-flight command at teardown.
const HANDLER_GRACE_FACTOR: u32 = 3;

/// Request/response access to a serial port.
pub trait PortDriver: Send + Sync {
    /// Port name, unique per adapter.
    fn name(&self) -> &str;

    /// True while the port is open and accepting commands.
    fn is_running(&self) -> bool;

    /// Send `request` and return the raw response bytes.
    ///
    /// Commands on one port complete in submission order.
    fn communicate(
        &self,
        request: Vec<u8>,
    ) -> impl Future<Output = ModbusResult<Vec<u8>>> + Send;
}

/// Lifecycle state published by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Closed,
    Opening,
    Running,
    /// Waiting to reopen after an open failure or hardware fault
    Faulted,
    Disposed,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortState::Closed => "closed",
            PortState::Opening => "opening",
            PortState::Running => "running",
            PortState::Faulted => "faulted",
            PortState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct LastError {
    message: String,
    at: DateTime<Utc>,
}

struct DriverShared {
    config: SerialPortConfig,
    running: AtomicBool,
    disposed: AtomicBool,
    command_ids: AtomicU64,
    open_attempts: AtomicU64,
    last_error: Mutex<Option<LastError>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    stats: Arc<PortStats>,
    metrics: Arc<dyn MetricsSink>,
    state_tx: watch::Sender<PortState>,
}

impl DriverShared {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn set_state(&self, state: PortState) {
        self.state_tx.send_replace(state);
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        self.metrics.port_running(self.name(), running);
    }

    fn record_error(&self, message: impl Into<String>) {
        let entry = LastError {
            message: message.into(),
            at: Utc::now(),
        };
        let _ = self.last_error.lock().map(|mut g| *g = Some(entry));
    }

    fn clear_error(&self) {
        let _ = self.last_error.lock().map(|mut g| *g = None);
    }

    fn last_error(&self) -> Option<LastError> {
        self.last_error.lock().ok().and_then(|g| g.clone())
    }

    fn set_sender(&self, sender: Option<mpsc::UnboundedSender<Command>>) {
        if let Ok(mut guard) = self.sender.lock() {
            *guard = sender;
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Command>> {
        self.sender.lock().ok().and_then(|g| g.clone())
    }
}

/// Why a running session ended.
enum SessionExit {
    Cancelled,
    Disposed,
    HardwareError(String),
}

struct Session {
    handle: Box<dyn SerialPortHandle>,
    handler: CommandHandler,
    hardware_errors: mpsc::UnboundedReceiver<String>,
}

/// Builder for [`SerialPortDriver`].
pub struct SerialPortDriverBuilder {
    config: SerialPortConfig,
    factory: Arc<dyn SerialPortFactory>,
    cleaner: Arc<dyn PortCleaner>,
    metrics: Arc<dyn MetricsSink>,
    options: DriverOptions,
    cancel: CancellationToken,
}

impl SerialPortDriverBuilder {
    pub fn with_cleaner(mut self, cleaner: Arc<dyn PortCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Tie the driver to an external shutdown signal.
    ///
    /// Cancelling the token closes the port and runs the cleanup hook.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Spawn the supervisor. Must be called within a tokio runtime.
    pub fn start(self) -> SerialPortDriver {
        let (state_tx, _) = watch::channel(PortState::Closed);
        let shared = Arc::new(DriverShared {
            config: self.config,
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            command_ids: AtomicU64::new(0),
            open_attempts: AtomicU64::new(0),
            last_error: Mutex::new(None),
            sender: Mutex::new(None),
            stats: Arc::new(PortStats::new()),
            metrics: self.metrics,
            state_tx,
        });
        let dispose = CancellationToken::new();

        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            factory: self.factory,
            cleaner: self.cleaner,
            options: self.options,
            cancel: self.cancel.clone(),
            dispose: dispose.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        SerialPortDriver {
            shared,
            dispose,
            supervisor: Mutex::new(Some(task)),
        }
    }
}

/// Driver of one physical serial port.
pub struct SerialPortDriver {
    shared: Arc<DriverShared>,
    dispose: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SerialPortDriver {
    pub fn builder(
        config: SerialPortConfig,
        factory: Arc<dyn SerialPortFactory>,
    ) -> SerialPortDriverBuilder {
        SerialPortDriverBuilder {
            config,
            factory,
            cleaner: Arc::new(NoopPortCleaner),
            metrics: Arc::new(NoopMetrics),
            options: DriverOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start a driver with default options, metrics and cleaner.
    pub fn start(config: SerialPortConfig, factory: Arc<dyn SerialPortFactory>) -> Self {
        Self::builder(config, factory).start()
    }

    pub fn config(&self) -> &SerialPortConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PortState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PortState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the port is running or `timeout` elapses.
    pub async fn wait_until_running(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == PortState::Running))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error().map(|e| e.message)
    }

    /// Number of open attempts since start.
    pub fn open_attempts(&self) -> u64 {
        self.shared.open_attempts.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PortStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.shared.stats.total_bytes_written()
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.shared.stats.total_bytes_read()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> Health {
        if self.is_running() {
            return Health::up();
        }
        if self.is_disposed() {
            return Health::down().with_detail("error", "already disposed");
        }
        match self.shared.last_error() {
            Some(err) => Health::out_of_service()
                .with_detail("lastError", err.message)
                .with_detail("since", err.at.to_rfc3339()),
            None => Health::out_of_service().with_detail("state", self.state()),
        }
    }

    /// Close the port for good. The cleanup hook is not invoked.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.set_sender(None);
        self.shared.set_running(false);
        self.dispose.cancel();
        info!(port = %self.name(), "serial port driver disposed");
    }

    /// Dispose and wait for the supervisor task to finish.
    pub async fn shutdown(&self) {
        self.dispose();
        let task = self.supervisor.lock().ok().and_then(|mut g| g.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl PortDriver for SerialPortDriver {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn communicate(
        &self,
        request: Vec<u8>,
    ) -> impl Future<Output = ModbusResult<Vec<u8>>> + Send {
        let shared = Arc::clone(&self.shared);
        async move {
            let id = shared.command_ids.fetch_add(1, Ordering::SeqCst) + 1;
            let not_running = || ModbusError::not_running(shared.name(), id);

            if !shared.running.load(Ordering::SeqCst) {
                return Err(not_running());
            }
            let sender = shared.sender().ok_or_else(not_running)?;
            let (command, result_rx) = Command::new(id, request);
            sender.send(command).map_err(|_| not_running())?;
            debug!(port = %shared.name(), command_id = id, "command scheduled");

            match result_rx.await {
                Ok(result) => result.into_result(),
                Err(_) => Err(not_running()),
            }
        }
    }
}

impl Drop for SerialPortDriver {
    fn drop(&mut self) {
        self.dispose.cancel();
    }
}

impl fmt::Debug for SerialPortDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPortDriver")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

struct Supervisor {
    shared: Arc<DriverShared>,
    factory: Arc<dyn SerialPortFactory>,
    cleaner: Arc<dyn PortCleaner>,
    options: DriverOptions,
    cancel: CancellationToken,
    dispose: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let name = self.shared.name().to_string();
        loop {
            if self.dispose.is_cancelled() {
                self.shared.set_state(PortState::Disposed);
                return;
            }
            if self.cancel.is_cancelled() {
                self.shared.set_state(PortState::Closed);
                return;
            }
            self.shared.set_state(PortState::Opening);
            let attempt = self.shared.open_attempts.fetch_add(1, Ordering::SeqCst) + 1;

            match self.open_session().await {
                Ok(session) => match self.run_session(session).await {
                    SessionExit::Cancelled => {
                        self.cleaner.clean(&name);
                        self.shared.set_state(PortState::Closed);
                        info!(port = %name, "serial port closed on cancellation");
                        return;
                    }
                    SessionExit::Disposed => {
                        self.shared.set_state(PortState::Disposed);
                        return;
                    }
                    SessionExit::HardwareError(message) => {
                        self.cleaner.clean(&name);
                        self.shared.record_error("hardware error");
                        warn!(port = %name, error = %message, "hardware error, port closed");
                    }
                },
                Err(e) => {
                    let message = match &e {
                        ModbusError::PortInUse { .. } | ModbusError::PortNotFound { .. } => {
                            e.to_string()
                        }
                        other => format!("unhandled error - {}", other),
                    };
                    self.shared.record_error(message);
                    warn!(
                        port = %name,
                        attempt,
                        delay_ms = self.options.reopen_delay.as_millis() as u64,
                        error = %e,
                        "failed to open serial port, retrying"
                    );
                }
            }

            self.shared.set_state(PortState::Faulted);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.shared.set_state(PortState::Closed);
                    return;
                }
                _ = self.dispose.cancelled() => {
                    self.shared.set_state(PortState::Disposed);
                    return;
                }
                _ = sleep(self.options.reopen_delay) => {}
            }
        }
    }

    async fn open_session(&self) -> ModbusResult<Session> {
        let config = &self.shared.config;
        let factory = Arc::clone(&self.factory);
        let target = config.clone();
        let mut handle = spawn_blocking(move || -> ModbusResult<Box<dyn SerialPortHandle>> {
            let mut handle = factory.open(&target.name)?;
            if let Err(e) = handle.configure(&target) {
                handle.close();
                return Err(e);
            }
            Ok(handle)
        })
        .await
        .map_err(|e| ModbusError::connection(format!("open task failed: {}", e)))??;

        let io = match handle.io() {
            Ok(io) => io,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };

        let data_ready = DataReadyFlag::new();
        let (hw_tx, hardware_errors) = mpsc::unbounded_channel();
        let flag = data_ready.clone();
        let listener: PortEventListener = Arc::new(move |event| match event {
            PortEvent::DataAvailable { new, old } => flag.notify_new_data_available(new, old),
            PortEvent::HardwareError(message) => {
                let _ = hw_tx.send(message);
            }
        });
        if let Err(e) = handle.add_event_listener(listener) {
            handle.close();
            return Err(e);
        }

        let handler = CommandHandler::new(config, io, data_ready)
            .with_stats(Arc::clone(&self.shared.stats))
            .with_metrics(Arc::clone(&self.shared.metrics));

        Ok(Session {
            handle,
            handler,
            hardware_errors,
        })
    }

    async fn run_session(&self, session: Session) -> SessionExit {
        let Session {
            mut handle,
            handler,
            mut hardware_errors,
        } = session;
        let name = self.shared.name();

        let (tx, rx) = mpsc::unbounded_channel();
        let handler_cancel = CancellationToken::new();
        let mut handler_task = tokio::spawn(handler.run(rx, handler_cancel.clone()));

        self.shared.set_sender(Some(tx));
        self.shared.clear_error();
        self.shared.set_running(true);
        self.shared.set_state(PortState::Running);
        info!(
            port = %name,
            baud_rate = self.shared.config.baud_rate,
            "serial port opened"
        );

        let exit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => SessionExit::Cancelled,
            _ = self.dispose.cancelled() => SessionExit::Disposed,
            message = hardware_errors.recv() => SessionExit::HardwareError(
                message.unwrap_or_else(|| "event listener dropped".to_string()),
            ),
        };

        self.shared.set_sender(None);
        self.shared.set_running(false);
        handler_cancel.cancel();

        // The in-flight command finishes before the port is closed under it;
        // queued ones are failed by the handler
        let grace = self.shared.config.response_wait() * HANDLER_GRACE_FACTOR;
        if timeout(grace, &mut handler_task).await.is_err() {
            warn!(port = %name, "command handler did not stop in time, aborting");
            handler_task.abort();
            let _ = handler_task.await;
        }
        handle.remove_event_listener();
        handle.close();
        exit
    }
}
