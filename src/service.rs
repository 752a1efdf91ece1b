//! Sensor Service
//!
//! Consumer-facing facade over the transports.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      SensorService                        │
//! │  connect / start / stop / disconnect / config setters     │
//! └───────────┬──────────────────────────────┬───────────────┘
//!             │                              │
//!             ▼                              ▼
//! ┌───────────────────────┐      ┌───────────────────────┐
//! │ Local backend         │      │ Relay backend         │
//! │ ChannelFactory ─►     │      │ BridgeSession         │
//! │ FirmwareDriver +      │      │ (samples decoded in   │
//! │ stream thread         │      │  the receive loop)    │
//! └───────────┬───────────┘      └───────────┬───────────┘
//!             └──────────────┬───────────────┘
//!                            ▼
//!                       SampleBus ──► subscribers
//! ```
//!
//! Samples go out on per-subscriber channels; picking the execution context
//! that consumes them is up to the subscriber.

use crate::domain::decoder::decode_signal_cluster;
use crate::domain::models::{
    BoardDetectionResult, ConnectionStatus, MessageSeverity, SampleRecord, SessionEvent,
    StatusMessage,
};
use crate::domain::sensors::{ExgConfiguration, SensorConfig};
use crate::domain::settings::{DeviceSettings, TransportKind};
use crate::error::{Error, Result};
use crate::infrastructure::board::ExpansionBoardProbe;
use crate::infrastructure::bridge::{BridgeConfig, BridgeSession, BridgeTimings, SampleHandler};
use crate::infrastructure::driver::{CalibrationScope, FirmwareDriver};
use crate::infrastructure::transport::establish::EstablishOptions;
use crate::infrastructure::transport::rfcomm::{self, RfcommBackend};
use crate::infrastructure::transport::serial::serial_channel;
use crate::infrastructure::transport::{ConnectionGate, RelayChannel, TransportChannel};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub type SubscriptionId = u64;

pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<SampleRecord>,
}

/// Fan-out of decoded samples. Records without any channel are never
/// delivered.
#[derive(Default)]
pub struct SampleBus {
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<SampleRecord>)>>,
    next_id: AtomicU64,
}

impl SampleBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((id, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sub, _)| *sub != id);
    }

    /// Deliver to every live subscriber; returns how many got it.
    pub fn publish(&self, record: SampleRecord) -> usize {
        if !record.has_data() {
            trace!("Not publishing empty sample");
            return 0;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, tx)| tx.send(record.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Wraps a transport channel in the consumer's firmware driver
pub type DriverFactory =
    Arc<dyn Fn(Box<dyn TransportChannel>) -> Box<dyn FirmwareDriver> + Send + Sync>;

/// Builds channels from settings. Owns the connection gate shared by every
/// local channel it creates.
pub struct ChannelFactory {
    gate: ConnectionGate,
    handle: Handle,
    rfcomm: Arc<dyn RfcommBackend>,
    bridge_timings: BridgeTimings,
}

impl ChannelFactory {
    /// Uses the host Bluetooth stack
    pub fn new(handle: Handle) -> Self {
        let rfcomm = rfcomm::system_backend(handle.clone());
        Self::with_backend(ConnectionGate::new(), handle, rfcomm)
    }

    pub fn with_backend(
        gate: ConnectionGate,
        handle: Handle,
        rfcomm: Arc<dyn RfcommBackend>,
    ) -> Self {
        Self {
            gate,
            handle,
            rfcomm,
            bridge_timings: BridgeTimings::default(),
        }
    }

    pub fn with_bridge_timings(mut self, timings: BridgeTimings) -> Self {
        self.bridge_timings = timings;
        self
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    /// Byte channel for `device.transport`. Nothing is opened yet.
    pub fn channel(&self, device: &DeviceSettings) -> Result<Box<dyn TransportChannel>> {
        let options = EstablishOptions::with_connect_timeout_ms(device.connect_timeout_ms);
        let read_timeout = Duration::from_millis(device.read_timeout_ms);

        Ok(match device.transport {
            TransportKind::Serial => Box::new(serial_channel(
                &device.target,
                device.baud_rate,
                read_timeout,
                self.gate.clone(),
                options,
            )),
            TransportKind::Bluetooth => Box::new(rfcomm::bluetooth_channel(
                &device.target,
                device.rfcomm_channel,
                self.rfcomm.clone(),
                self.gate.clone(),
                options,
            )?),
            TransportKind::Relay => {
                let on_sample: SampleHandler = Arc::new(|record: SampleRecord| {
                    trace!("Relay sample at {} outside a session", record.timestamp)
                });
                let session = self.bridge_session(device, on_sample, None);
                Box::new(RelayChannel::new(
                    Arc::new(session),
                    self.handle.clone(),
                    read_timeout,
                ))
            }
        })
    }

    pub fn bridge_session(
        &self,
        device: &DeviceSettings,
        on_sample: SampleHandler,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> BridgeSession {
        let mut timings = self.bridge_timings.clone();
        timings.connect_timeout = Duration::from_millis(device.effective_connect_timeout_ms());

        BridgeSession::new(
            BridgeConfig {
                url: device.target.clone(),
                mac: device.relay_device_mac.clone(),
                toggles: device.sensors.relay_toggles(),
                sampling_rate: device.sampling_rate,
                timings,
            },
            on_sample,
            events,
        )
    }
}

/// Push the full configuration into the driver, then start streaming.
/// Any failing command aborts the sequence.
pub fn configure_driver(driver: &mut dyn FirmwareDriver, device: &DeviceSettings) -> Result<()> {
    let sensors = &device.sensors;

    driver.inquiry()?;
    driver.write_sampling_rate(device.sampling_rate)?;
    driver.write_sensors(sensors.sensor_bitmap())?;
    driver.write_accel_range(sensors.accel_range)?;
    driver.write_gyro_range(sensors.gyro_range)?;
    driver.write_mag_range(sensors.mag_range)?;
    driver.write_low_power_accel(sensors.low_power_accel)?;
    driver.write_low_power_gyro(sensors.low_power_gyro)?;
    driver.write_low_power_mag(sensors.low_power_mag)?;
    if let Some(exg) = &sensors.exg_configuration {
        driver.write_exg_configuration(1, &exg.chip1)?;
        driver.write_exg_configuration(2, &exg.chip2)?;
    }
    driver.write_internal_exp_power(sensors.internal_expansion_power)?;
    driver.read_calibration_parameters(CalibrationScope::All)?;
    driver.start_streaming()?;

    info!(
        "Driver configured: {} Hz, sensors {:#08X}",
        device.sampling_rate,
        sensors.sensor_bitmap()
    );
    Ok(())
}

type SharedDriver = Arc<Mutex<Box<dyn FirmwareDriver>>>;

/// Background thread pulling signal clusters off the driver
struct StreamWorker {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl StreamWorker {
    fn spawn(
        driver: SharedDriver,
        bus: Arc<SampleBus>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name("sample-stream".to_string())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    match catch_unwind(AssertUnwindSafe(|| pump(&driver, &bus))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!("Sample stream stopped: {}", e);
                            let _ = events.send(SessionEvent::Log(StatusMessage {
                                message: format!("Sample stream stopped: {}", e),
                                severity: MessageSeverity::Warning,
                            }));
                            let _ = events.send(SessionEvent::Status(ConnectionStatus::Error));
                            break;
                        }
                        Err(_) => warn!("Sample decoding panicked; packet dropped"),
                    }
                }
                debug!("Sample stream thread exiting");
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Sample stream thread panicked");
            }
        }
    }
}

/// Read one cluster and publish it
fn pump(driver: &SharedDriver, bus: &SampleBus) -> Result<()> {
    let next = driver.lock().read_signals()?;
    if let Some(cluster) = next {
        let signals = cluster.iter().map(|(name, value)| (name.as_str(), *value));
        if let Some(record) = decode_signal_cluster(signals) {
            bus.publish(record);
        }
    }
    Ok(())
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

enum Backend {
    Local {
        driver: SharedDriver,
        worker: Option<StreamWorker>,
    },
    Relay(Arc<BridgeSession>),
}

pub struct SensorService {
    device: DeviceSettings,
    factory: ChannelFactory,
    driver_factory: Option<DriverFactory>,
    probe: ExpansionBoardProbe,
    bus: Arc<SampleBus>,
    events: mpsc::UnboundedSender<SessionEvent>,
    backend: Option<Backend>,
    status: ConnectionStatus,
}

impl SensorService {
    pub fn new(
        device: DeviceSettings,
        factory: ChannelFactory,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            device,
            factory,
            driver_factory: None,
            probe: ExpansionBoardProbe::default(),
            bus: Arc::new(SampleBus::new()),
            events,
            backend: None,
            status: ConnectionStatus::Disconnected,
        }
    }

    /// Required for serial and Bluetooth transports
    pub fn with_driver_factory(mut self, driver_factory: DriverFactory) -> Self {
        self.driver_factory = Some(driver_factory);
        self
    }

    pub fn with_probe(mut self, probe: ExpansionBoardProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Reflects a relay link that dropped or a stream thread that died
    /// since the last call into the service.
    pub fn status(&self) -> ConnectionStatus {
        match &self.backend {
            Some(Backend::Relay(session)) if !session.is_connected() => {
                ConnectionStatus::Disconnected
            }
            Some(Backend::Local {
                worker: Some(worker),
                ..
            }) if !worker.is_running() => ConnectionStatus::Error,
            _ => self.status,
        }
    }

    pub fn device(&self) -> &DeviceSettings {
        &self.device
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id);
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.reap().await;
        if self.backend.is_some() {
            return Ok(());
        }
        self.set_status(ConnectionStatus::Connecting);
        self.send_log(
            &format!("Connecting to {} over {:?}", self.device.target, self.device.transport),
            MessageSeverity::Info,
        );

        let connected = match self.device.transport {
            TransportKind::Relay => self.connect_relay().await,
            TransportKind::Serial | TransportKind::Bluetooth => self.connect_local().await,
        };

        match connected {
            Ok(backend) => {
                self.backend = Some(backend);
                self.set_status(ConnectionStatus::Connected);
                self.send_log("Connected", MessageSeverity::Success);
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Error);
                self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    async fn connect_local(&self) -> Result<Backend> {
        let driver_factory = self.driver_factory.clone().ok_or_else(|| {
            Error::Driver("no firmware driver registered for local transports".to_string())
        })?;
        let channel = self.factory.channel(&self.device)?;
        let probe = self.probe.clone();

        let (driver, board) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut driver = driver_factory(channel);
            driver.connect()?;
            match driver.firmware_version() {
                Ok(version) => info!("Firmware: {}", version),
                Err(e) => warn!("Firmware version query failed: {}", e),
            }
            let board = probe.detect(driver.as_mut());
            Ok((driver, board))
        })
        .await
        .map_err(join_error)??;

        self.emit(SessionEvent::BoardDetected(board));
        Ok(Backend::Local {
            driver: Arc::new(Mutex::new(driver)),
            worker: None,
        })
    }

    async fn connect_relay(&self) -> Result<Backend> {
        let bus = self.bus.clone();
        let on_sample: SampleHandler = Arc::new(move |record: SampleRecord| {
            bus.publish(record);
        });
        let session = Arc::new(self.factory.bridge_session(
            &self.device,
            on_sample,
            Some(self.events.clone()),
        ));
        session.connect().await?;

        debug!("Relay sessions carry no expansion board interface");
        self.emit(SessionEvent::BoardDetected(BoardDetectionResult::unknown()));
        Ok(Backend::Relay(session))
    }

    pub async fn start_streaming(&mut self) -> Result<()> {
        self.reap().await;
        let device = self.device.clone();
        let bus = self.bus.clone();
        let events = self.events.clone();

        match self.backend.as_mut() {
            None => return Err(Error::NotConnected),
            Some(Backend::Relay(session)) => session.start().await?,
            Some(Backend::Local { driver, worker }) => {
                if worker.is_some() {
                    return Ok(());
                }
                let configured = driver.clone();
                tokio::task::spawn_blocking(move || {
                    let mut driver = configured.lock();
                    configure_driver(driver.as_mut(), &device)
                })
                .await
                .map_err(join_error)??;
                *worker = Some(StreamWorker::spawn(driver.clone(), bus, events)?);
            }
        }

        self.set_status(ConnectionStatus::Streaming);
        Ok(())
    }

    /// Errors from the device are logged, not returned.
    pub async fn stop_streaming(&mut self) {
        match self.backend.as_mut() {
            None => return,
            Some(Backend::Relay(session)) => session.stop().await,
            Some(Backend::Local { driver, worker }) => {
                let worker = worker.take();
                let driver = driver.clone();
                let stopped = tokio::task::spawn_blocking(move || {
                    if let Some(worker) = worker {
                        worker.shutdown();
                    }
                    driver.lock().stop_streaming()
                })
                .await;
                match stopped {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Stop streaming: {}", e),
                    Err(e) => warn!("Stop streaming task failed: {}", e),
                }
            }
        }
        self.set_status(ConnectionStatus::Connected);
    }

    /// Tear everything down. Safe to call repeatedly; never fails.
    pub async fn disconnect(&mut self) {
        match self.backend.take() {
            None => {}
            Some(Backend::Relay(session)) => session.disconnect().await,
            Some(Backend::Local { driver, worker }) => {
                let closed = tokio::task::spawn_blocking(move || {
                    if let Some(worker) = worker {
                        worker.shutdown();
                    }
                    let mut driver = driver.lock();
                    if let Err(e) = driver.stop_streaming() {
                        debug!("stop before disconnect: {}", e);
                    }
                    driver.disconnect();
                })
                .await;
                if let Err(e) = closed {
                    warn!("Disconnect task failed: {}", e);
                }
            }
        }
        if self.status != ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Disconnected);
            self.send_log("Disconnected", MessageSeverity::Info);
        }
    }

    pub async fn set_sampling_rate(&mut self, hz: f64) {
        self.device.sampling_rate = hz;
        self.push_config().await;
    }

    /// Replace the enable flags and every other sensor setting at once
    pub async fn set_sensor_config(&mut self, sensors: SensorConfig) {
        self.device.sensors = sensors;
        self.push_config().await;
    }

    pub async fn set_accel_range(&mut self, range: u8) {
        self.device.sensors.accel_range = range;
        self.push_config().await;
    }

    pub async fn set_gyro_range(&mut self, range: u8) {
        self.device.sensors.gyro_range = range;
        self.push_config().await;
    }

    pub async fn set_mag_range(&mut self, range: u8) {
        self.device.sensors.mag_range = range;
        self.push_config().await;
    }

    pub async fn set_low_power(&mut self, accel: bool, gyro: bool, mag: bool) {
        let sensors = &mut self.device.sensors;
        sensors.low_power_accel = accel;
        sensors.low_power_gyro = gyro;
        sensors.low_power_mag = mag;
        self.push_config().await;
    }

    pub async fn set_exg_configuration(&mut self, exg: Option<ExgConfiguration>) {
        self.device.sensors.exg_configuration = exg;
        self.push_config().await;
    }

    pub async fn set_internal_expansion_power(&mut self, enabled: bool) {
        self.device.sensors.internal_expansion_power = enabled;
        self.push_config().await;
    }

    /// Relay sessions are reconfigured right away; local drivers pick the
    /// change up on the next start.
    async fn push_config(&self) {
        match &self.backend {
            Some(Backend::Relay(session)) => {
                let toggles = self.device.sensors.relay_toggles();
                session.set_relay_config(toggles, self.device.sampling_rate);
                session.configure().await;
            }
            Some(Backend::Local { worker: Some(_), .. }) => {
                debug!("Configuration change applies on the next start");
            }
            _ => {}
        }
    }

    /// Drop a relay session whose socket died and a stream thread that
    /// exited on its own, so the next connect or start rebuilds them.
    async fn reap(&mut self) {
        let relay_lost = matches!(
            &self.backend,
            Some(Backend::Relay(session)) if !session.is_connected()
        );
        if relay_lost {
            if let Some(Backend::Relay(session)) = self.backend.take() {
                warn!("Relay link to {} was lost", session.url());
                session.disconnect().await;
            }
            self.status = ConnectionStatus::Disconnected;
        }

        if let Some(Backend::Local { worker, .. }) = self.backend.as_mut() {
            if worker.as_ref().is_some_and(|w| !w.is_running()) {
                if let Some(finished) = worker.take() {
                    finished.shutdown();
                }
                debug!("Sample stream had stopped; ready to restart");
                self.status = ConnectionStatus::Connected;
            }
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.emit(SessionEvent::Status(status));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(SessionEvent::Log(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Driver(format!("driver task failed: {}", e))
}
