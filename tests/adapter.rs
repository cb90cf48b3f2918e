mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, Meter, SimulatedFactory};
use serial_modbus_adapter::{
    AdapterConfig, DeviceConfig, DeviceFunction, FunctionExecutor, HealthStatus,
    InMemoryMetrics, ModbusError, PortDriver, PortEvent, PortRegistry, PortState, RegisterId,
    SerialPortConfig, SerialPortDriver,
};

const PORT: &str = "/dev/ttyMETER";

fn meter() -> Meter {
    Meter::new()
        .with_i32(RegisterId::TotalPower.value(), 65791)
        .with_i32(RegisterId::ExportPower.value(), 1234)
        .with_i32(RegisterId::ImportPower.value(), 5678)
        .with_i32(RegisterId::CurrentPower.value(), 1500)
        .with_i32(RegisterId::DeviceId.value(), 1)
        .with_i16(RegisterId::VoltagePhase1.value(), 2331)
        .with_i16(RegisterId::AmperagePhase2.value(), 52)
}

fn config() -> AdapterConfig {
    AdapterConfig::new()
        .with_port(SerialPortConfig::new(PORT).with_response_wait_ms(500))
        .with_device(
            DeviceConfig::new(1, "main", PORT).with_functions([
                DeviceFunction::TotalPower,
                DeviceFunction::ProducedPower,
                DeviceFunction::ConsumedPower,
                DeviceFunction::CurrentPower,
                DeviceFunction::DeviceId,
                DeviceFunction::CurrentVoltagePhase1,
                DeviceFunction::CurrentAmperagePhase2,
            ]),
        )
}

async fn wait_running(registry: &PortRegistry) {
    let driver = registry.driver(PORT).unwrap();
    assert!(driver.wait_until_running(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn test_registry_reads_every_function() {
    init_tracing();
    let factory = SimulatedFactory::new();
    let bus = factory.add_port(PORT);
    bus.attach(1, meter());

    let registry = PortRegistry::builder(config(), factory.clone())
        .with_enumerator(factory.clone())
        .start()
        .unwrap();
    wait_running(&registry).await;

    let total = registry.query("main", DeviceFunction::TotalPower).await.unwrap();
    assert!((total.value.as_f64() - 657.91).abs() < 1e-3);
    assert_eq!(total.unit, "kWh");

    let produced = registry.query("main", DeviceFunction::ProducedPower).await.unwrap();
    assert!((produced.value.as_f64() - 12.34).abs() < 1e-3);

    let consumed = registry.query("main", DeviceFunction::ConsumedPower).await.unwrap();
    assert!((consumed.value.as_f64() - 56.78).abs() < 1e-3);

    let power = registry.query("main", DeviceFunction::CurrentPower).await.unwrap();
    assert_eq!(power.value.as_f64(), 1500.0);
    assert_eq!(power.unit, "W");

    let id = registry.query("main", DeviceFunction::DeviceId).await.unwrap();
    assert_eq!(id.value.as_u8(), Some(1));

    let volts = registry
        .query("main", DeviceFunction::CurrentVoltagePhase1)
        .await
        .unwrap();
    assert!((volts.value.as_f64() - 233.1).abs() < 1e-3);

    let amps = registry
        .query("main", DeviceFunction::CurrentAmperagePhase2)
        .await
        .unwrap();
    assert!((amps.value.as_f64() - 5.2).abs() < 1e-3);

    let device = registry.device("main").unwrap();
    assert!(device.health().await.is_up());
    assert_eq!(device.call_count(), 8);
    assert_eq!(registry.health().status, HealthStatus::Up);

    let driver = registry.driver(PORT).unwrap();
    assert_eq!(driver.total_bytes_written(), 8 * 8);
    assert_eq!(driver.total_bytes_read(), 8 * 9);

    registry.shutdown().await;
    assert_eq!(registry.health().status, HealthStatus::Down);
    assert_eq!(bus.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_device_and_function() {
    let factory = SimulatedFactory::new();
    factory.add_port(PORT).attach(1, meter());
    let registry = PortRegistry::builder(config(), factory).start().unwrap();
    wait_running(&registry).await;

    assert!(matches!(
        registry.query("other", DeviceFunction::TotalPower).await,
        Err(ModbusError::InvalidArgument { .. })
    ));
    assert!(matches!(
        registry
            .query("main", DeviceFunction::CurrentVoltagePhase3)
            .await,
        Err(ModbusError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let factory = SimulatedFactory::new();
    let config = AdapterConfig::new()
        .with_port(SerialPortConfig::new(PORT).with_baud_rate(19200))
        .with_device(DeviceConfig::new(1, "main", PORT).with_function(DeviceFunction::TotalPower));

    let err = PortRegistry::builder(config, factory).start().unwrap_err();
    assert!(matches!(err, ModbusError::Configuration { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_response_is_retried() {
    let factory = SimulatedFactory::new();
    let bus = factory.add_port(PORT);
    bus.attach(1, meter());
    let registry = PortRegistry::builder(config(), factory).start().unwrap();
    wait_running(&registry).await;

    bus.corrupt_next(1);
    let total = registry.query("main", DeviceFunction::TotalPower).await.unwrap();
    assert!((total.value.as_f64() - 657.91).abs() < 1e-3);
    assert_eq!(bus.request_count(), 2);

    bus.corrupt_next(3);
    let err = registry
        .query("main", DeviceFunction::TotalPower)
        .await
        .unwrap_err();
    assert!(matches!(err, ModbusError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(err.root_cause(), &ModbusError::CrcCheck);
    assert_eq!(bus.request_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_times_out() {
    let factory = SimulatedFactory::new();
    let bus = factory.add_port(PORT);
    let registry = PortRegistry::builder(config(), factory).start().unwrap();
    wait_running(&registry).await;

    let err = registry
        .query("main", DeviceFunction::CurrentPower)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(bus.request_count(), 1);

    let health = registry.device("main").unwrap().health().await;
    assert_eq!(health.status, HealthStatus::Down);
    // Port is fine even though the meter is not
    assert_eq!(registry.health().status, HealthStatus::Up);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_devices_share_one_port() {
    let factory = SimulatedFactory::new();
    let bus = factory.add_port(PORT);
    bus.attach(1, Meter::new().with_i32(RegisterId::CurrentPower.value(), 100));
    bus.attach(2, Meter::new().with_i32(RegisterId::CurrentPower.value(), 200));

    let config = AdapterConfig::new()
        .with_port(SerialPortConfig::new(PORT))
        .with_device(DeviceConfig::new(1, "a", PORT).with_function(DeviceFunction::CurrentPower))
        .with_device(DeviceConfig::new(2, "b", PORT).with_function(DeviceFunction::CurrentPower));
    let registry = Arc::new(PortRegistry::builder(config, factory).start().unwrap());
    wait_running(&registry).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let registry = Arc::clone(&registry);
        let (name, expected) = if i % 2 == 0 { ("a", 100.0) } else { ("b", 200.0) };
        tasks.push(tokio::spawn(async move {
            let response = registry.query(name, DeviceFunction::CurrentPower).await?;
            assert_eq!(response.value.as_f64(), expected);
            Ok::<_, ModbusError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(bus.request_count(), 20);
    let driver = registry.driver(PORT).unwrap();
    assert_eq!(driver.stats().commands_sent, 20);
    assert_eq!(driver.stats().errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_port_in_use_recovers_after_reopen_delay() {
    let factory = SimulatedFactory::new();
    let bus = factory.add_port(PORT);
    bus.attach(1, meter());
    bus.reject_opens(2);

    let config = SerialPortConfig::new(PORT);
    let driver = SerialPortDriver::start(config, factory);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!driver.is_running());
    assert_eq!(driver.health().status, HealthStatus::OutOfService);
    assert_eq!(
        driver.last_error().as_deref(),
        Some("serial port is in use - locked by another process")
    );

    assert!(driver.wait_until_running(Duration::from_secs(11)).await);
    assert_eq!(bus.opens.load(Ordering::SeqCst), 3);

    let executor = FunctionExecutor::new();
    let state = executor.check_state(&driver, 1).await.unwrap();
    assert_eq!(state, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hardware_error_reopens_port() {
    let factory = SimulatedFactory::new();
    let bus = factory.add_port(PORT);
    bus.attach(1, meter());
    let metrics = Arc::new(InMemoryMetrics::new());

    let registry = PortRegistry::builder(config(), factory)
        .with_metrics(metrics.clone())
        .start()
        .unwrap();
    wait_running(&registry).await;
    assert!(metrics.port(PORT).running);

    let driver = Arc::clone(registry.driver(PORT).unwrap());
    bus.fire(PortEvent::HardwareError("device unplugged".into()));
    let mut state = driver.subscribe();
    state.wait_for(|s| *s == PortState::Faulted).await.unwrap();

    assert!(!metrics.port(PORT).running);
    assert_eq!(registry.health().status, HealthStatus::OutOfService);
    let health = registry.device("main").unwrap().health().await;
    assert_eq!(health.status, HealthStatus::Down);
    assert!(matches!(
        driver.communicate(vec![0; 8]).await,
        Err(ModbusError::NotRunning { .. })
    ));

    assert!(driver.wait_until_running(Duration::from_secs(6)).await);
    assert!(registry.device("main").unwrap().health().await.is_up());
    assert_eq!(bus.opens.load(Ordering::SeqCst), 2);
    assert!(metrics.port(PORT).bytes_written > 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_port_is_out_of_service() {
    let factory = SimulatedFactory::new();
    let registry = PortRegistry::builder(config(), factory.clone())
        .with_enumerator(factory)
        .start()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let health = registry.health();
    assert_eq!(health.status, HealthStatus::OutOfService);
    assert_eq!(health.detail(PORT), Some("OUT_OF_SERVICE"));

    let driver = registry.driver(PORT).unwrap();
    assert_eq!(driver.state(), PortState::Faulted);
    assert!(driver.last_error().unwrap().contains(PORT));

    let err = registry
        .query("main", DeviceFunction::TotalPower)
        .await
        .unwrap_err();
    assert!(matches!(err, ModbusError::NotRunning { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_closes_ports_and_runs_cleaner() {
    let factory = SimulatedFactory::new();
    let bus = factory.add_port(PORT);
    bus.attach(1, meter());
    let cleaned = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&cleaned);
    let cancel = tokio_util::sync::CancellationToken::new();

    let registry = PortRegistry::builder(config(), factory)
        .with_cleaner(Arc::new(move |port: &str| sink.lock().unwrap().push(port.to_string())))
        .with_cancellation(cancel.clone())
        .start()
        .unwrap();
    wait_running(&registry).await;

    cancel.cancel();
    let mut state = registry.driver(PORT).unwrap().subscribe();
    state.wait_for(|s| *s == PortState::Closed).await.unwrap();

    assert_eq!(*cleaned.lock().unwrap(), vec![PORT.to_string()]);
    assert_eq!(bus.closes.load(Ordering::SeqCst), 1);
    assert_eq!(registry.health().status, HealthStatus::OutOfService);
}
