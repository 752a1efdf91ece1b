//! Bluetooth Classic RFCOMM channel
//!
//! Candidates are tried in a fixed order: secure socket on the configured
//! channel, insecure socket on the same channel, then the legacy fallback
//! of an insecure socket on channel 1.

use crate::error::{Error, Result};
use crate::infrastructure::transport::establish::{
    AdapterControl, EstablishOptions, LinkSocket, LinkStrategy, LocalChannel, LocalKind,
};
use crate::infrastructure::transport::ConnectionGate;
use std::io;
use std::sync::Arc;

/// Channel used by the legacy fallback candidate
pub const LEGACY_CHANNEL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfcommMode {
    /// Authenticated and encrypted link
    Secure,
    Insecure,
}

/// Platform access to RFCOMM sockets
pub trait RfcommBackend: Send + Sync {
    fn adapter(&self) -> Arc<dyn AdapterControl>;

    fn socket(&self, address: [u8; 6], channel: u8, mode: RfcommMode)
        -> io::Result<Arc<dyn LinkSocket>>;
}

/// Parse `AA:BB:CC:DD:EE:FF` (also `-` separated or bare hex).
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let hex: String = text
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidAddress(format!("'{}' is not a Bluetooth MAC", text)));
    }

    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::InvalidAddress(text.to_string()))?;
    }
    Ok(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

struct RfcommStrategy {
    name: String,
    backend: Arc<dyn RfcommBackend>,
    address: [u8; 6],
    channel: u8,
    mode: RfcommMode,
}

impl LinkStrategy for RfcommStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_socket(&self) -> io::Result<Arc<dyn LinkSocket>> {
        self.backend.socket(self.address, self.channel, self.mode)
    }
}

/// Build an RFCOMM [`LocalChannel`]. Fails with `InvalidAddress` when `mac`
/// does not parse.
pub fn bluetooth_channel(
    mac: &str,
    channel: u8,
    backend: Arc<dyn RfcommBackend>,
    gate: ConnectionGate,
    options: EstablishOptions,
) -> Result<LocalChannel> {
    let address = parse_mac(mac)?;
    let candidates = [
        ("secure", channel, RfcommMode::Secure),
        ("insecure", channel, RfcommMode::Insecure),
        ("legacy-channel", LEGACY_CHANNEL, RfcommMode::Insecure),
    ];
    let strategies = candidates
        .into_iter()
        .map(|(name, channel, mode)| {
            Box::new(RfcommStrategy {
                name: format!("{}(ch {})", name, channel),
                backend: backend.clone(),
                address,
                channel,
                mode,
            }) as Box<dyn LinkStrategy>
        })
        .collect();

    Ok(LocalChannel::new(
        LocalKind::Bluetooth,
        format_mac(&address),
        gate,
        backend.adapter(),
        strategies,
        options,
    ))
}

/// Backend for the host's Bluetooth stack.
#[cfg(feature = "bluez")]
pub fn system_backend(handle: tokio::runtime::Handle) -> Arc<dyn RfcommBackend> {
    Arc::new(bluez::BluezBackend::new(handle))
}

/// Backend for the host's Bluetooth stack. This build has none, so every
/// open fails fast with `AdapterUnavailable`.
#[cfg(not(feature = "bluez"))]
pub fn system_backend(_handle: tokio::runtime::Handle) -> Arc<dyn RfcommBackend> {
    Arc::new(NoBackend)
}

#[cfg(not(feature = "bluez"))]
struct NoBackend;

#[cfg(not(feature = "bluez"))]
impl AdapterControl for NoBackend {
    fn ensure_available(&self) -> Result<()> {
        Err(Error::AdapterUnavailable(
            "built without Bluetooth support (enable the `bluez` feature)".into(),
        ))
    }
}

#[cfg(not(feature = "bluez"))]
impl RfcommBackend for NoBackend {
    fn adapter(&self) -> Arc<dyn AdapterControl> {
        Arc::new(NoBackend)
    }

    fn socket(&self, _: [u8; 6], _: u8, _: RfcommMode) -> io::Result<Arc<dyn LinkSocket>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "no Bluetooth backend"))
    }
}

#[cfg(feature = "bluez")]
mod bluez {
    use super::RfcommMode;
    use crate::error::{Error, Result};
    use crate::infrastructure::transport::establish::{AdapterControl, LinkSocket};
    use crate::infrastructure::transport::rfcomm::RfcommBackend;
    use bluer::rfcomm::{Security, SecurityLevel, Socket, SocketAddr, Stream};
    use bluer::{Adapter, Address, Session};
    use parking_lot::Mutex;
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::runtime::Handle;
    use tokio::task::AbortHandle;
    use tracing::info;

    pub struct BluezBackend {
        adapter: Arc<BluezAdapter>,
        handle: Handle,
    }

    impl BluezBackend {
        pub fn new(handle: Handle) -> Self {
            Self {
                adapter: Arc::new(BluezAdapter {
                    handle: handle.clone(),
                    inner: Mutex::new(None),
                }),
                handle,
            }
        }
    }

    impl RfcommBackend for BluezBackend {
        fn adapter(&self) -> Arc<dyn AdapterControl> {
            self.adapter.clone()
        }

        fn socket(
            &self,
            address: [u8; 6],
            channel: u8,
            mode: RfcommMode,
        ) -> io::Result<Arc<dyn LinkSocket>> {
            let level = match mode {
                RfcommMode::Secure => SecurityLevel::Medium,
                RfcommMode::Insecure => SecurityLevel::Low,
            };
            Ok(Arc::new(BluezSocket {
                handle: self.handle.clone(),
                addr: SocketAddr::new(Address::new(address), channel),
                level,
                stream: Mutex::new(None),
                pending: Mutex::new(None),
                connected: AtomicBool::new(false),
            }))
        }
    }

    struct BluezAdapter {
        handle: Handle,
        inner: Mutex<Option<(Session, Adapter)>>,
    }

    impl AdapterControl for BluezAdapter {
        fn ensure_available(&self) -> Result<()> {
            let (session, adapter, powered) = self
                .handle
                .block_on(async {
                    let session = Session::new().await?;
                    let adapter = session.default_adapter().await?;
                    let powered = adapter.is_powered().await?;
                    Ok::<_, bluer::Error>((session, adapter, powered))
                })
                .map_err(|e| Error::AdapterUnavailable(e.to_string()))?;

            if !powered {
                return Err(Error::AdapterUnavailable(format!(
                    "adapter {} is powered off",
                    adapter.name()
                )));
            }
            *self.inner.lock() = Some((session, adapter));
            Ok(())
        }

        fn is_discovering(&self) -> bool {
            let adapter = match self.inner.lock().as_ref() {
                Some((_, adapter)) => adapter.clone(),
                None => return false,
            };
            self.handle
                .block_on(adapter.is_discovering())
                .unwrap_or(false)
        }

        /// This crate never starts an inquiry, so an active one belongs to
        /// another D-Bus client. BlueZ only honours `StopDiscovery` from the
        /// client that started it; the inquiry ends when that client
        /// releases it.
        fn cancel_discovery(&self) -> Result<()> {
            let name = match self.inner.lock().as_ref() {
                Some((_, adapter)) => adapter.name().to_string(),
                None => return Ok(()),
            };
            Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("discovery on {} is owned by another BlueZ client", name),
            )))
        }
    }

    struct BluezSocket {
        handle: Handle,
        addr: SocketAddr,
        level: SecurityLevel,
        stream: Mutex<Option<Stream>>,
        pending: Mutex<Option<AbortHandle>>,
        connected: AtomicBool,
    }

    impl LinkSocket for BluezSocket {
        fn connect(&self) -> io::Result<()> {
            let addr = self.addr;
            let level = self.level;
            let task = self.handle.spawn(async move {
                let socket = Socket::new()?;
                socket.set_security(Security { level, key_size: 0 })?;
                socket.connect(addr).await
            });
            *self.pending.lock() = Some(task.abort_handle());

            let result = self.handle.block_on(task);
            self.pending.lock().take();

            match result {
                Ok(Ok(stream)) => {
                    info!("RFCOMM connected to {}", self.addr.addr);
                    *self.stream.lock() = Some(stream);
                    self.connected.store(true, Ordering::SeqCst);
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "RFCOMM connect aborted",
                )),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn close(&self) {
            if let Some(pending) = self.pending.lock().take() {
                pending.abort();
            }
            self.stream.lock().take();
            self.connected.store(false, Ordering::SeqCst);
        }

        fn streams(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
            let stream = self
                .stream
                .lock()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no RFCOMM stream"))?;
            let (read_half, write_half) = stream.into_split();
            Ok((
                Box::new(Blocking {
                    handle: self.handle.clone(),
                    inner: read_half,
                }),
                Box::new(Blocking {
                    handle: self.handle.clone(),
                    inner: write_half,
                }),
            ))
        }
    }

    /// Drives an async half from a blocking caller
    struct Blocking<T> {
        handle: Handle,
        inner: T,
    }

    impl<T: AsyncRead + Unpin> Read for Blocking<T> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.handle.block_on(self.inner.read(buf))
        }
    }

    impl<T: AsyncWrite + Unpin> Write for Blocking<T> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.handle.block_on(self.inner.write(buf))
        }

        fn flush(&mut self) -> io::Result<()> {
            self.handle.block_on(self.inner.flush())
        }
    }
}
