//! Modbus function execution.
//!
//! A [`ModbusFunction`] is one logical meter read. [`FunctionExecutor`] runs it
//! against a [`PortDriver`]:
//!
//! 1. build the 8-byte request and append its CRC
//! 2. `communicate`, keeping the first [`RESPONSE_FRAME_SIZE`] bytes
//! 3. verify the CRC, then that byte 0 echoes the device id
//! 4. decode the typed value
//!
//! CRC and device-id failures are retried (2 retries, 100 ms apart by default);
//! every other error fails immediately. The whole execution, retries included,
//! is bounded by the policy deadline.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serial_modbus_adapter::{FunctionExecutor, RegisterId, SerialPortConfig, SerialPortDriver};
//! # use serial_modbus_adapter::port::SerialPortFactory;
//!
//! # async fn example(factory: Arc<dyn SerialPortFactory>) -> serial_modbus_adapter::ModbusResult<()> {
//! let driver = SerialPortDriver::start(SerialPortConfig::new("/dev/ttyUSB0"), factory);
//! let executor = FunctionExecutor::new();
//!
//! let kwh = executor.read_total_power(&driver, 1, RegisterId::ImportPower).await?;
//! let volts = executor.read_current_voltage(&driver, 1, RegisterId::VoltagePhase1).await?;
//! println!("{kwh} kWh, {volts} V");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::bytes::{be_i16_at, be_i32_at, u8_at, DATA_OFFSET};
use crate::config::RetryPolicy;
use crate::constants::RESPONSE_FRAME_SIZE;
use crate::crc::{CrcService, ModbusCrc};
use crate::driver::PortDriver;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::FunctionArgs;
use crate::logging::{CommunicationLogger, NoopCommunicationLogger};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::register::RegisterId;
use crate::value::ModbusValue;

/// How a response payload turns into a value.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Decoding {
    /// Big-endian i32 at the data offset divided by the scale
    I32 { scale: f32 },
    /// Big-endian i16 at the data offset divided by the scale
    I16 { scale: f32 },
    /// Byte 0 of the frame
    DeviceByte,
}

/// Logical meter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    /// Energy counter in kWh (total, export or import register)
    ReadTotalPower,
    /// Instantaneous power in W
    ReadCurrentPower,
    /// Phase voltage in V
    ReadCurrentVoltage,
    /// Phase current in A
    ReadCurrentAmperage,
    /// Device id echo, used as a liveness check
    CheckState,
}

impl ModbusFunction {
    pub const ALL: [ModbusFunction; 5] = [
        ModbusFunction::ReadTotalPower,
        ModbusFunction::ReadCurrentPower,
        ModbusFunction::ReadCurrentVoltage,
        ModbusFunction::ReadCurrentAmperage,
        ModbusFunction::CheckState,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadTotalPower => "ReadTotalPower",
            ModbusFunction::ReadCurrentPower => "ReadCurrentPower",
            ModbusFunction::ReadCurrentVoltage => "ReadCurrentVoltage",
            ModbusFunction::ReadCurrentAmperage => "ReadCurrentAmperage",
            ModbusFunction::CheckState => "ReadModbusDeviceId",
        }
    }

    /// Bytes kept from the raw response.
    pub const fn response_size(self) -> usize {
        RESPONSE_FRAME_SIZE
    }

    const fn decoding(self) -> Decoding {
        match self {
            ModbusFunction::ReadTotalPower => Decoding::I32 { scale: 100.0 },
            ModbusFunction::ReadCurrentPower => Decoding::I32 { scale: 1.0 },
            ModbusFunction::ReadCurrentVoltage | ModbusFunction::ReadCurrentAmperage => {
                Decoding::I16 { scale: 10.0 }
            }
            ModbusFunction::CheckState => Decoding::DeviceByte,
        }
    }

    /// Decode a validated response frame.
    pub fn decode(self, response: &[u8]) -> ModbusResult<ModbusValue> {
        match self.decoding() {
            Decoding::I32 { scale } => {
                be_i32_at(response, DATA_OFFSET).map(|v| ModbusValue::F32(v as f32 / scale))
            }
            Decoding::I16 { scale } => {
                be_i16_at(response, DATA_OFFSET).map(|v| ModbusValue::F32(f32::from(v) / scale))
            }
            Decoding::DeviceByte => u8_at(response, 0).map(ModbusValue::U8),
        }
    }

    /// Build the arguments for reading `register` from `device_id`.
    pub fn args<'a, D: PortDriver>(
        self,
        driver: &'a D,
        device_id: u8,
        register: RegisterId,
    ) -> ModbusResult<FunctionArgs<'a, D>> {
        match self {
            ModbusFunction::ReadTotalPower => {
                FunctionArgs::read_total_power(driver, device_id, register)
            }
            ModbusFunction::ReadCurrentPower if register == RegisterId::CurrentPower => {
                Ok(FunctionArgs::read_current_power(driver, device_id))
            }
            ModbusFunction::ReadCurrentVoltage => {
                FunctionArgs::read_current_voltage(driver, device_id, register)
            }
            ModbusFunction::ReadCurrentAmperage => {
                FunctionArgs::read_current_amperage(driver, device_id, register)
            }
            ModbusFunction::CheckState if register == RegisterId::DeviceId => {
                Ok(FunctionArgs::check_state(driver, device_id))
            }
            other => Err(ModbusError::invalid_argument(format!(
                "{} cannot read register {}",
                other, register
            ))),
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs [`ModbusFunction`]s with validation, retries and a deadline.
pub struct FunctionExecutor {
    crc: Arc<dyn CrcService>,
    logger: Arc<dyn CommunicationLogger>,
    metrics: Arc<dyn MetricsSink>,
    policy: RetryPolicy,
    execution_ids: AtomicU64,
}

impl Default for FunctionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionExecutor {
    pub fn new() -> Self {
        Self {
            crc: Arc::new(ModbusCrc),
            logger: Arc::new(NoopCommunicationLogger),
            metrics: Arc::new(NoopMetrics),
            policy: RetryPolicy::default(),
            execution_ids: AtomicU64::new(0),
        }
    }

    pub fn with_crc(mut self, crc: Arc<dyn CrcService>) -> Self {
        self.crc = crc;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn CommunicationLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `function` with prepared arguments.
    pub async fn execute<D: PortDriver>(
        &self,
        function: ModbusFunction,
        args: &FunctionArgs<'_, D>,
    ) -> ModbusResult<ModbusValue> {
        let execution_id = self.execution_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let context = format!("[{}] {}", execution_id, args);
        let started = Instant::now();

        let outcome = match timeout(
            self.policy.deadline,
            self.execute_with_retries(function, args, &context),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ModbusError::timeout(
                format!("{} function {}", context, function),
                self.policy.deadline.as_millis() as u64,
            )),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(value) => info!(
                port = %args.driver().name(),
                elapsed_ms,
                "{} function {} - completed with {} after {} ms",
                context,
                function,
                value,
                elapsed_ms
            ),
            Err(e) => warn!(
                port = %args.driver().name(),
                elapsed_ms,
                error = %e,
                "{} function {} - failed after {} ms",
                context,
                function,
                elapsed_ms
            ),
        }
        self.metrics.function_completed(function.name(), outcome.is_ok());
        outcome
    }

    /// Build arguments for `register` and execute.
    pub async fn run<D: PortDriver>(
        &self,
        function: ModbusFunction,
        driver: &D,
        device_id: u8,
        register: RegisterId,
    ) -> ModbusResult<ModbusValue> {
        let args = function.args(driver, device_id, register)?;
        self.execute(function, &args).await
    }

    async fn execute_with_retries<D: PortDriver>(
        &self,
        function: ModbusFunction,
        args: &FunctionArgs<'_, D>,
        context: &str,
    ) -> ModbusResult<ModbusValue> {
        let request = args.to_message(|buf| self.crc.calculate_crc(buf))?;
        let mut retries = 0u32;
        loop {
            match self.attempt(function, args, &request, context).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.policy.max_retries => {
                    retries += 1;
                    debug!(
                        port = %args.driver().name(),
                        "{} retry {}/{} after: {}",
                        context,
                        retries,
                        self.policy.max_retries,
                        e
                    );
                    sleep(self.policy.delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(ModbusError::RetriesExhausted {
                        attempts: retries + 1,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt<D: PortDriver>(
        &self,
        function: ModbusFunction,
        args: &FunctionArgs<'_, D>,
        request: &[u8],
        context: &str,
    ) -> ModbusResult<ModbusValue> {
        let raw = args.driver().communicate(request.to_vec()).await?;
        let response = &raw[..raw.len().min(function.response_size())];
        self.logger.log_communication(context, request, response);

        if !self.crc.check_crc(response) {
            return Err(ModbusError::CrcCheck);
        }
        if !args.response_device_matches(response) {
            return Err(ModbusError::DeviceIdMismatch {
                expected: args.device_id(),
                actual: response.first().copied().unwrap_or_default(),
            });
        }
        function.decode(response)
    }

    // ===== Typed reads =====

    /// Energy counter in kWh from a total, export or import register.
    pub async fn read_total_power<D: PortDriver>(
        &self,
        driver: &D,
        device_id: u8,
        register: RegisterId,
    ) -> ModbusResult<f32> {
        let value = self
            .run(ModbusFunction::ReadTotalPower, driver, device_id, register)
            .await?;
        expect_f32(value)
    }

    pub async fn read_current_power<D: PortDriver>(
        &self,
        driver: &D,
        device_id: u8,
    ) -> ModbusResult<f32> {
        let value = self
            .run(
                ModbusFunction::ReadCurrentPower,
                driver,
                device_id,
                RegisterId::CurrentPower,
            )
            .await?;
        expect_f32(value)
    }

    pub async fn read_current_voltage<D: PortDriver>(
        &self,
        driver: &D,
        device_id: u8,
        register: RegisterId,
    ) -> ModbusResult<f32> {
        let value = self
            .run(ModbusFunction::ReadCurrentVoltage, driver, device_id, register)
            .await?;
        expect_f32(value)
    }

    pub async fn read_current_amperage<D: PortDriver>(
        &self,
        driver: &D,
        device_id: u8,
        register: RegisterId,
    ) -> ModbusResult<f32> {
        let value = self
            .run(ModbusFunction::ReadCurrentAmperage, driver, device_id, register)
            .await?;
        expect_f32(value)
    }

    /// Returns the device id echoed by the meter.
    pub async fn check_state<D: PortDriver>(&self, driver: &D, device_id: u8) -> ModbusResult<u8> {
        let value = self
            .run(ModbusFunction::CheckState, driver, device_id, RegisterId::DeviceId)
            .await?;
        value
            .as_u8()
            .ok_or_else(|| ModbusError::invalid_data(format!("expected u8, got {}", value.type_name())))
    }
}

fn expect_f32(value: ModbusValue) -> ModbusResult<f32> {
    value
        .as_f32()
        .ok_or_else(|| ModbusError::invalid_data(format!("expected f32, got {}", value.type_name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::CallbackLogger;
    use crate::metrics::InMemoryMetrics;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    // =========================================================================
    // MockDriver
    // =========================================================================

    /// Driver returning queued responses and recording requests
    struct MockDriver {
        requests: Mutex<Vec<Vec<u8>>>,
        responses: Mutex<VecDeque<ModbusResult<Vec<u8>>>>,
        hang: bool,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(VecDeque::new()),
                hang: false,
            }
        }

        fn add_response(&self, response: ModbusResult<Vec<u8>>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl PortDriver for MockDriver {
        fn name(&self) -> &str {
            "mock"
        }

        fn is_running(&self) -> bool {
            true
        }

        fn communicate(
            &self,
            request: Vec<u8>,
        ) -> impl std::future::Future<Output = ModbusResult<Vec<u8>>> + Send {
            self.requests.lock().unwrap().push(request);
            let hang = self.hang;
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModbusError::connection("No response prepared in mock")));
            async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                response
            }
        }
    }

    /// CRC service with a fixed check result
    struct ForcedCrc(bool);

    impl CrcService for ForcedCrc {
        fn calculate_crc(&self, _buf: &mut [u8]) {}

        fn check_crc(&self, _buf: &[u8]) -> bool {
            self.0
        }
    }

    fn forced(result: bool) -> FunctionExecutor {
        FunctionExecutor::new().with_crc(Arc::new(ForcedCrc(result)))
    }

    fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
        ModbusCrc.calculate_crc(&mut frame);
        frame
    }

    const POWER_FRAME: [u8; 9] = [0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF];
    const VOLTAGE_FRAME: [u8; 9] = [0x01, 0x03, 0x04, 0x09, 0x1B, 0x00, 0x00, 0xFF, 0xFF];

    // =========================================================================
    // Decoding
    // =========================================================================

    #[tokio::test]
    async fn test_read_current_power() {
        let driver = MockDriver::new();
        driver.add_response(Ok(POWER_FRAME.to_vec()));

        let watts = forced(true).read_current_power(&driver, 1).await.unwrap();
        assert_eq!(watts, 65791.0);
    }

    #[tokio::test]
    async fn test_read_total_power() {
        let driver = MockDriver::new();
        driver.add_response(Ok(POWER_FRAME.to_vec()));

        let kwh = forced(true)
            .read_total_power(&driver, 1, RegisterId::TotalPower)
            .await
            .unwrap();
        assert!((kwh - 657.91).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_read_voltage_and_amperage() {
        let driver = MockDriver::new();
        driver.add_response(Ok(VOLTAGE_FRAME.to_vec()));
        driver.add_response(Ok(VOLTAGE_FRAME.to_vec()));
        let executor = forced(true);

        let volts = executor
            .read_current_voltage(&driver, 1, RegisterId::VoltagePhase1)
            .await
            .unwrap();
        assert!((volts - 233.1).abs() < 1e-3);

        let amps = executor
            .read_current_amperage(&driver, 1, RegisterId::AmperagePhase1)
            .await
            .unwrap();
        assert!((amps - 233.1).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_wrong_register_family_sends_nothing() {
        let driver = MockDriver::new();
        let executor = FunctionExecutor::new();

        let err = executor
            .read_current_amperage(&driver, 1, RegisterId::VoltagePhase2)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidArgument { .. }));
        assert_err!(executor.read_current_voltage(&driver, 1, RegisterId::AmperagePhase3).await);
        assert_err!(executor.read_total_power(&driver, 1, RegisterId::CurrentPower).await);
        assert_eq!(driver.request_count(), 0);
    }

    #[tokio::test]
    async fn test_check_state_returns_device_byte() {
        let driver = MockDriver::new();
        driver.add_response(Ok(with_crc(vec![0x07, 0x03, 0x04, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00])));

        let id = FunctionExecutor::new().check_state(&driver, 7).await.unwrap();
        assert_eq!(id, 7);

        let request = driver.requests.lock().unwrap()[0].clone();
        assert_eq!(&request[..6], &[0x07, 0x03, 0x00, 0x15, 0x00, 0x02]);
        assert!(ModbusCrc.check_crc(&request));
    }

    #[tokio::test]
    async fn test_response_is_truncated_to_frame_size() {
        let driver = MockDriver::new();
        let mut frame = with_crc(POWER_FRAME.to_vec());
        frame.extend([0xAA, 0xBB, 0xCC]);
        driver.add_response(Ok(frame));

        let watts = FunctionExecutor::new().read_current_power(&driver, 1).await.unwrap();
        assert_eq!(watts, 65791.0);
    }

    #[test]
    fn test_decode_short_frame() {
        let err = ModbusFunction::ReadTotalPower.decode(&[0x01, 0x03, 0x04]).unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
    }

    #[test]
    fn test_args_mapping() {
        let driver = MockDriver::new();
        assert_err!(ModbusFunction::ReadCurrentPower.args(&driver, 1, RegisterId::TotalPower));
        assert_ok!(ModbusFunction::CheckState.args(&driver, 1, RegisterId::DeviceId));
        assert_err!(ModbusFunction::ReadTotalPower.args(&driver, 1, RegisterId::VoltagePhase1));
    }

    // =========================================================================
    // Validation and retries
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_crc_failure_exhausts_retries() {
        let driver = MockDriver::new();
        for _ in 0..3 {
            driver.add_response(Ok(POWER_FRAME.to_vec()));
        }

        let started = tokio::time::Instant::now();
        let err = forced(false).read_current_power(&driver, 1).await.unwrap_err();

        match &err {
            ModbusError::RetriesExhausted { attempts, source } => {
                assert_eq!(*attempts, 3);
                assert_eq!(**source, ModbusError::CrcCheck);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(driver.request_count(), 3);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_id_mismatch_even_with_valid_crc() {
        let driver = MockDriver::new();
        let foreign = with_crc(vec![0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);
        for _ in 0..3 {
            driver.add_response(Ok(foreign.clone()));
        }

        let err = FunctionExecutor::new()
            .read_current_power(&driver, 1)
            .await
            .unwrap_err();

        assert_eq!(
            err.root_cause(),
            &ModbusError::DeviceIdMismatch {
                expected: 1,
                actual: 2
            }
        );
        assert_eq!(driver.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_one_bad_crc() {
        let driver = MockDriver::new();
        driver.add_response(Ok(POWER_FRAME.to_vec()));
        driver.add_response(Ok(with_crc(POWER_FRAME.to_vec())));

        let watts = FunctionExecutor::new().read_current_power(&driver, 1).await.unwrap();
        assert_eq!(watts, 65791.0);
        assert_eq!(driver.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_noise_is_retried() {
        let driver = MockDriver::new();
        driver.add_response(Ok(vec![0x55; 256]));
        driver.add_response(Ok(with_crc(POWER_FRAME.to_vec())));

        let watts = FunctionExecutor::new().read_current_power(&driver, 1).await.unwrap();
        assert_eq!(watts, 65791.0);
        assert_eq!(driver.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_protocol_errors_are_not_retried() {
        let driver = MockDriver::new();
        driver.add_response(Err(ModbusError::timeout("ttyUSB0 - did not receive any data", 2000)));

        let err = forced(true).read_current_power(&driver, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert_eq!(driver.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let mut driver = MockDriver::new();
        driver.hang = true;
        driver.add_response(Ok(POWER_FRAME.to_vec()));

        let started = tokio::time::Instant::now();
        let err = forced(true).read_current_power(&driver, 1).await.unwrap_err();

        assert!(matches!(err, ModbusError::Timeout { timeout_ms: 5000, .. }));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_policy() {
        let driver = MockDriver::new();
        driver.add_response(Ok(POWER_FRAME.to_vec()));
        let executor = forced(false).with_policy(RetryPolicy::default().with_max_retries(0));

        let err = executor.read_current_power(&driver, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_logger_and_metrics_observe_each_call() {
        let driver = MockDriver::new();
        driver.add_response(Ok(POWER_FRAME.to_vec()));
        driver.add_response(Err(ModbusError::io("broken")));

        let logged = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&logged);
        let metrics = Arc::new(InMemoryMetrics::new());
        let executor = forced(true)
            .with_logger(Arc::new(CallbackLogger::new(move |ctx, _req, resp| {
                sink.lock().unwrap().push((ctx.to_string(), resp.len()));
            })))
            .with_metrics(metrics.clone());

        executor.read_current_power(&driver, 1).await.unwrap();
        executor.read_current_power(&driver, 1).await.unwrap_err();

        let logged = logged.lock().unwrap();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].0.starts_with("[1] 1.CurrentPower"));
        assert_eq!(logged[0].1, 9);

        let totals = metrics.function("ReadCurrentPower");
        assert_eq!(totals.succeeded, 1);
        assert_eq!(totals.failed, 1);
    }
}
