//! Bridge Session
//!
//! One WebSocket session per relay-connected device. The handshake runs in
//! order, each step gated on the previous one:
//!
//! ```text
//! socket ─► hello (hard, 3 s) ─► open ×8 (soft, 600 ms each)
//!        ─► set_config (soft, 6 s) ─► [start: open ×8 ─► start (hard, 12 s)]
//! ```
//!
//! A single receive loop owns the read half for the lifetime of the socket.
//! It resolves acknowledgements, decodes samples and keeps the link alive
//! with periodic pings.

use crate::domain::decoder::{decode_json_sample, decode_raw_frame};
use crate::domain::models::{
    ConnectionStatus, MessageSeverity, SampleRecord, SessionEvent, StatusMessage,
};
use crate::domain::sensors::SensorToggles;
use crate::error::{Error, Result};
use crate::infrastructure::bridge::ack::{wait_ack, AckOutcome, PendingAcks};
use crate::infrastructure::bridge::protocol::{AckKind, ControlMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type SharedSink = Arc<tokio::sync::Mutex<Option<WsSink>>>;

/// Receives every decoded sample, in arrival order
pub type SampleHandler = Arc<dyn Fn(SampleRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    SocketConnecting,
    HelloPending,
    Subscribing,
    Configuring,
    Streaming,
    Stopping,
    Closed,
}

/// Handshake timing
#[derive(Debug, Clone)]
pub struct BridgeTimings {
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub hello_timeout: Duration,
    pub open_timeout: Duration,
    pub open_attempts: u32,
    pub open_spacing: Duration,
    pub config_timeout: Duration,
    pub start_timeout: Duration,
}

impl Default for BridgeTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(8000),
            keepalive: Duration::from_secs(15),
            hello_timeout: Duration::from_millis(3000),
            open_timeout: Duration::from_millis(600),
            open_attempts: 8,
            open_spacing: Duration::from_millis(200),
            config_timeout: Duration::from_millis(6000),
            start_timeout: Duration::from_millis(12_000),
        }
    }
}

/// Everything needed to reach one device through the relay
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// `ws://host:port/path`
    pub url: String,
    /// Device MAC as known to the relay
    pub mac: String,
    pub toggles: SensorToggles,
    pub sampling_rate: f64,
    pub timings: BridgeTimings,
}

/// State touched by both the caller and the receive loop
struct Shared {
    state: Mutex<BridgeState>,
    connected: AtomicBool,
    acks: PendingAcks,
    on_sample: SampleHandler,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    tap: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Shared {
    fn set_state(&self, state: BridgeState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Bridge state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Returns false when the relay closed the socket.
    fn handle_frame(&self, frame: Message) -> bool {
        match frame {
            Message::Text(text) => self.handle_text(text.as_str()),
            Message::Binary(data) => {
                if matches!(data.first(), Some(b'{') | Some(b'[')) {
                    match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_text(text),
                        Err(_) => self.handle_binary(&data),
                    }
                } else {
                    self.handle_binary(&data);
                }
            }
            Message::Close(frame) => {
                info!("Relay closed the session: {:?}", frame);
                return false;
            }
            _ => {}
        }
        true
    }

    fn handle_text(&self, text: &str) {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring relay frame ({}): {:.80}", e, text);
                return;
            }
        };

        if let Some((kind, ack)) = message.as_ack() {
            if !self.acks.resolve(kind, ack) {
                debug!("Unsolicited {:?} acknowledgement", kind);
            }
            return;
        }

        match message {
            ControlMessage::Sample(body) => {
                if let Some(record) = decode_json_sample(&Value::Object(body)) {
                    self.dispatch(record);
                }
            }
            ControlMessage::ConfigChanged { cfg } => {
                info!("Relay configuration changed");
                self.emit(SessionEvent::ConfigChanged(cfg));
            }
            ControlMessage::Error { error } => {
                warn!("Relay error: {}", error);
                self.acks.fail_all(&error);
                self.emit(SessionEvent::Log(StatusMessage {
                    message: format!("Relay error: {}", error),
                    severity: MessageSeverity::Warning,
                }));
            }
            other => debug!("Ignoring client-bound message {:?}", other),
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        if let Some(tap) = self.tap.lock().as_ref() {
            let _ = tap.send(data.to_vec());
        }
        if let Some(record) = decode_raw_frame(data) {
            self.dispatch(record);
        }
    }

    fn dispatch(&self, record: SampleRecord) {
        let on_sample = &self.on_sample;
        if catch_unwind(AssertUnwindSafe(|| on_sample(record))).is_err() {
            warn!("Sample subscriber panicked; frame dropped");
        }
    }
}

pub struct BridgeSession {
    url: String,
    mac: String,
    relay_config: Mutex<(SensorToggles, f64)>,
    timings: BridgeTimings,
    shared: Arc<Shared>,
    sink: SharedSink,
    cancel: Mutex<CancellationToken>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeSession {
    pub fn new(
        config: BridgeConfig,
        on_sample: SampleHandler,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        Self {
            url: config.url,
            mac: config.mac,
            relay_config: Mutex::new((config.toggles, config.sampling_rate)),
            timings: config.timings,
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState::Disconnected),
                connected: AtomicBool::new(false),
                acks: PendingAcks::new(),
                on_sample,
                events,
                tap: Mutex::new(None),
            }),
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            cancel: Mutex::new(CancellationToken::new()),
            reader: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.shared.state.lock()
    }

    /// True while the socket is up and the receive loop runs
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Route non-JSON binary frames to `tap` as well as the raw decoder.
    pub fn set_binary_tap(&self, tap: Option<mpsc::UnboundedSender<Vec<u8>>>) {
        *self.shared.tap.lock() = tap;
    }

    /// Update the sensor toggles and rate sent with `set_config`.
    pub fn set_relay_config(&self, toggles: SensorToggles, sampling_rate: f64) {
        *self.relay_config.lock() = (toggles, sampling_rate);
    }

    /// Open the socket and run hello, subscribe and configure.
    ///
    /// Only socket and hello failures are returned; subscribe and configure
    /// degrade to warnings.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::InvalidAddress(format!(
                "relay URL must be ws:// or wss://, got '{}'",
                self.url
            )));
        }

        self.shared.set_state(BridgeState::SocketConnecting);
        info!("Connecting to relay {}", self.url);

        let connecting = timeout(self.timings.connect_timeout, connect_async(self.url.as_str()));
        let stream = match connecting.await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(BridgeState::Disconnected);
                return Err(Error::ConnectFailed {
                    target: self.url.clone(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()),
                });
            }
            Err(_) => {
                self.shared.set_state(BridgeState::Disconnected);
                return Err(Error::ConnectFailed {
                    target: self.url.clone(),
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!(
                            "relay connect timed out after {} ms",
                            self.timings.connect_timeout.as_millis()
                        ),
                    ),
                });
            }
        };

        let (sink, stream) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.shared.connected.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        *self.reader.lock() = Some(tokio::spawn(receive_loop(
            self.shared.clone(),
            self.sink.clone(),
            stream,
            token,
            self.timings.keepalive,
        )));

        self.shared.set_state(BridgeState::HelloPending);
        if let Err(e) = self.hello().await {
            self.teardown().await;
            self.shared.set_state(BridgeState::Disconnected);
            return Err(e);
        }

        self.shared.set_state(BridgeState::Subscribing);
        self.subscribe().await;

        self.shared.set_state(BridgeState::Configuring);
        self.configure().await;

        info!("Relay session ready for {}", self.mac);
        Ok(())
    }

    async fn hello(&self) -> Result<()> {
        let rx = self.shared.acks.register(AckKind::Hello);
        self.send(&ControlMessage::Hello).await?;
        let outcome = wait_ack(rx, self.timings.hello_timeout).await;
        if outcome.is_accepted() {
            Ok(())
        } else {
            Err(Error::Handshake {
                step: "hello",
                reason: outcome.describe(),
            })
        }
    }

    /// Retry `open` until acknowledged. Returns whether the relay confirmed;
    /// callers proceed either way.
    async fn subscribe(&self) -> bool {
        let attempts = self.timings.open_attempts.max(1);
        for attempt in 1..=attempts {
            let rx = self.shared.acks.register(AckKind::Open);
            let open = ControlMessage::Open {
                mac: self.mac.clone(),
            };
            match self.send(&open).await {
                Ok(()) => {
                    let outcome = wait_ack(rx, self.timings.open_timeout).await;
                    if outcome.is_accepted() {
                        debug!("Subscribed to {} (attempt {})", self.mac, attempt);
                        return true;
                    }
                    debug!("open attempt {}/{}: {}", attempt, attempts, outcome.describe());
                }
                Err(e) => debug!("open attempt {}/{} not sent: {}", attempt, attempts, e),
            }
            if attempt < attempts {
                sleep(self.timings.open_spacing).await;
            }
        }
        warn!(
            "Relay never acknowledged open for {} after {} attempts; continuing",
            self.mac, attempts
        );
        false
    }

    /// Send `set_config`. A negative or missing ack is logged only.
    pub async fn configure(&self) {
        let (toggles, sampling_rate) = *self.relay_config.lock();
        let rx = self.shared.acks.register(AckKind::Config);
        let message = ControlMessage::SetConfig {
            toggles,
            sampling_rate,
        };
        if let Err(e) = self.send(&message).await {
            warn!("set_config not sent: {}", e);
            return;
        }
        match wait_ack(rx, self.timings.config_timeout).await {
            AckOutcome::Accepted => info!("Relay accepted configuration ({} Hz)", sampling_rate),
            outcome => warn!("Relay configuration {}", outcome.describe()),
        }
    }

    /// Re-assert the subscription, then require `start_ack`.
    pub async fn start(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.subscribe().await;

        let rx = self.shared.acks.register(AckKind::Start);
        self.send(&ControlMessage::Start {
            mac: self.mac.clone(),
        })
        .await?;

        let outcome = wait_ack(rx, self.timings.start_timeout).await;
        if outcome.is_accepted() {
            self.shared.set_state(BridgeState::Streaming);
            info!("Relay streaming from {}", self.mac);
            Ok(())
        } else {
            Err(Error::Handshake {
                step: "start",
                reason: outcome.describe(),
            })
        }
    }

    /// Send `stop`; errors are swallowed.
    pub async fn stop(&self) {
        self.shared.set_state(BridgeState::Stopping);
        if let Err(e) = self.send(&ControlMessage::Stop).await {
            debug!("stop not sent: {}", e);
        }
        if self.is_connected() {
            self.shared.set_state(BridgeState::Configuring);
        }
    }

    /// Send `stop` and `close`, then tear down. Never fails.
    pub async fn disconnect(&self) {
        if self.is_connected() {
            for message in [ControlMessage::Stop, ControlMessage::Close] {
                if let Err(e) = self.send(&message).await {
                    debug!("{:?} not sent during disconnect: {}", message, e);
                }
            }
        }
        self.teardown().await;
        self.shared.set_state(BridgeState::Closed);
        info!("Relay session closed");
    }

    /// Write a binary data-plane frame
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotConnected)?;
        sink.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    async fn send(&self, message: &ControlMessage) -> Result<()> {
        let text = message.encode()?;
        trace!("relay <- {}", text);
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotConnected)?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Stop the receive loop, wait for it, then close the socket.
    async fn teardown(&self) {
        self.cancel.lock().cancel();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("Relay receive loop ended abnormally: {}", e);
            }
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("Relay socket close: {}", e);
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.acks.clear();
    }
}

impl Drop for BridgeSession {
    /// Stops the receive loop so the socket closes even without `disconnect`.
    fn drop(&mut self) {
        self.cancel.get_mut().cancel();
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    sink: SharedSink,
    mut stream: SplitStream<WsStream>,
    cancel: CancellationToken,
    keepalive: Duration,
) {
    let mut ping = interval_at(Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => {
                if let Some(sink) = sink.lock().await.as_mut() {
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        warn!("Relay keep-alive failed: {}", e);
                        break;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if !shared.handle_frame(frame) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("Relay receive error: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.acks.clear();
    if !cancel.is_cancelled() {
        shared.set_state(BridgeState::Disconnected);
        shared.emit(SessionEvent::Status(ConnectionStatus::Disconnected));
        shared.emit(SessionEvent::Log(StatusMessage {
            message: "Relay connection lost".to_string(),
            severity: MessageSeverity::Error,
        }));
    }
    debug!("Relay receive loop finished");
}
