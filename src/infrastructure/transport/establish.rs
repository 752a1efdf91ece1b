//! Local Channel Establishment
//!
//! Connects a serial or RFCOMM link by walking an ordered list of
//! strategies under the shared [`ConnectionGate`]. Each strategy gets one
//! timed attempt; the first one that connects wins.

use crate::error::{Error, Result};
use crate::infrastructure::transport::{window, ConnectionGate, TransportChannel};
use std::io::{self, Read, Write};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A socket created by a strategy. `connect` may block; `close` must be
/// callable from another thread and unblock a pending `connect`.
pub trait LinkSocket: Send + Sync {
    fn connect(&self) -> io::Result<()>;

    fn is_connected(&self) -> bool;

    /// Best-effort
    fn close(&self);

    /// Bind the input and output streams of a connected socket.
    fn streams(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;

    /// Drop pending inbound bytes
    fn clear_input(&self) -> io::Result<()> {
        Ok(())
    }
}

/// One candidate way of reaching the device
pub trait LinkStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn create_socket(&self) -> io::Result<Arc<dyn LinkSocket>>;
}

/// Adapter-level checks run before any candidate is tried
pub trait AdapterControl: Send + Sync {
    /// Fails with a configuration error when the adapter or port is missing
    /// or disabled.
    fn ensure_available(&self) -> Result<()>;

    fn is_discovering(&self) -> bool {
        false
    }

    /// Stop an active inquiry. Failure is soft: the caller waits out the
    /// discovery stop window and connects anyway.
    fn cancel_discovery(&self) -> Result<()> {
        Ok(())
    }
}

/// Timing knobs for [`establish`]
#[derive(Debug, Clone)]
pub struct EstablishOptions {
    pub connect_timeout: Duration,
    pub discovery_stop_wait: Duration,
    pub settle_delay: Duration,
    pub backoff: Duration,
}

impl Default for EstablishOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(8000),
            discovery_stop_wait: Duration::from_millis(500),
            settle_delay: Duration::from_millis(200),
            backoff: Duration::from_millis(200),
        }
    }
}

impl EstablishOptions {
    pub fn with_connect_timeout_ms(timeout_ms: u64) -> Self {
        Self {
            connect_timeout: Duration::from_millis(
                timeout_ms.max(crate::domain::settings::MIN_CONNECT_TIMEOUT_MS),
            ),
            ..Default::default()
        }
    }
}

/// A connected socket with its streams bound
pub struct EstablishedLink {
    pub socket: Arc<dyn LinkSocket>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub strategy: String,
}

/// Try `strategies` in order until one connects.
///
/// Holds `gate` for the whole attempt. On total failure the error names
/// `target` and wraps the last underlying cause.
pub fn establish(
    target: &str,
    gate: &ConnectionGate,
    adapter: &dyn AdapterControl,
    strategies: &[Box<dyn LinkStrategy>],
    options: &EstablishOptions,
) -> Result<EstablishedLink> {
    adapter.ensure_available()?;

    let _pass = gate.acquire();
    debug!("Connection gate acquired for {}", target);

    if adapter.is_discovering() {
        info!("Cancelling device discovery before connecting");
        if let Err(e) = adapter.cancel_discovery() {
            warn!("Could not cancel discovery: {}", e);
        }
        let deadline = Instant::now() + options.discovery_stop_wait;
        while adapter.is_discovering() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(25));
        }
        if adapter.is_discovering() {
            warn!("Discovery still active after {:?}", options.discovery_stop_wait);
        }
    }
    thread::sleep(options.settle_delay);

    let mut last_error: Option<io::Error> = None;

    for (index, strategy) in strategies.iter().enumerate() {
        info!(
            "Connecting to {} via {} ({}/{})",
            target,
            strategy.name(),
            index + 1,
            strategies.len()
        );

        match attempt(strategy.as_ref(), options.connect_timeout) {
            Ok(link) => {
                info!("Connected to {} via {}", target, strategy.name());
                return Ok(link);
            }
            Err(e) => {
                warn!("{} failed for {}: {}", strategy.name(), target, e);
                last_error = Some(e);
            }
        }

        if index + 1 < strategies.len() {
            thread::sleep(options.backoff);
        }
    }

    Err(Error::ConnectFailed {
        target: target.to_string(),
        source: last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no connection strategies available")
        }),
    })
}

fn attempt(strategy: &dyn LinkStrategy, timeout: Duration) -> io::Result<EstablishedLink> {
    let socket = strategy.create_socket()?;

    let connected = timed_connect(socket.clone(), timeout).and_then(|()| {
        if socket.is_connected() {
            socket.streams()
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket reports not connected after connect",
            ))
        }
    });

    match connected {
        Ok((reader, writer)) => Ok(EstablishedLink {
            socket,
            reader,
            writer,
            strategy: strategy.name().to_string(),
        }),
        Err(e) => {
            socket.close();
            Err(e)
        }
    }
}

/// Run the blocking connect on its own thread and wait at most `timeout`.
/// On timeout the socket is force-closed to unblock the abandoned call.
fn timed_connect(socket: Arc<dyn LinkSocket>, timeout: Duration) -> io::Result<()> {
    let (tx, rx) = mpsc::channel();
    let worker = socket.clone();
    thread::Builder::new()
        .name("link-connect".to_string())
        .spawn(move || {
            let _ = tx.send(worker.connect());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            socket.close();
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {} ms", timeout.as_millis()),
            ))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(io::Error::new(
            io::ErrorKind::Other,
            "connect worker exited without a result",
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    Serial,
    Bluetooth,
}

/// Serial or RFCOMM channel built from a strategy list
pub struct LocalChannel {
    kind: LocalKind,
    target: String,
    gate: ConnectionGate,
    adapter: Arc<dyn AdapterControl>,
    strategies: Vec<Box<dyn LinkStrategy>>,
    options: EstablishOptions,
    link: Option<EstablishedLink>,
}

impl LocalChannel {
    pub fn new(
        kind: LocalKind,
        target: impl Into<String>,
        gate: ConnectionGate,
        adapter: Arc<dyn AdapterControl>,
        strategies: Vec<Box<dyn LinkStrategy>>,
        options: EstablishOptions,
    ) -> Self {
        Self {
            kind,
            target: target.into(),
            gate,
            adapter,
            strategies,
            options,
            link: None,
        }
    }

    pub fn kind(&self) -> LocalKind {
        self.kind
    }

    /// Name of the strategy that won, while open
    pub fn connected_via(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.strategy.as_str())
    }

    fn not_bound() -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "channel streams are not bound",
        ))
    }
}

impl TransportChannel for LocalChannel {
    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        // Stale link from a dropped connection
        self.close();

        let link = establish(
            &self.target,
            &self.gate,
            self.adapter.as_ref(),
            &self.strategies,
            &self.options,
        )?;
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            let EstablishedLink {
                socket,
                reader,
                mut writer,
                strategy,
            } = link;
            drop(reader);
            let _ = writer.flush();
            drop(writer);
            socket.close();
            debug!("Closed {} ({})", self.target, strategy);
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let link = self.link.as_mut().ok_or_else(Self::not_bound)?;
        let mut byte = [0u8; 1];
        loop {
            match link.reader.read(&mut byte) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "end of stream",
                    )))
                }
                Ok(_) => return Ok(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_bytes(&mut self, buffer: &[u8], offset: usize, length: usize) -> Result<()> {
        let link = self.link.as_mut().ok_or_else(Self::not_bound)?;
        let bytes = window(buffer, offset, length)?;
        link.writer.write_all(bytes)?;
        link.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            link.writer.flush()?;
        }
        Ok(())
    }

    fn flush_input(&mut self) -> Result<()> {
        if let Some(link) = self.link.as_ref() {
            link.socket.clear_input()?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link
            .as_ref()
            .map(|l| l.socket.is_connected())
            .unwrap_or(false)
    }

    fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}
