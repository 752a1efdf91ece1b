//! Relay byte channel
//!
//! Presents a [`BridgeSession`] as a [`TransportChannel`]: outbound bytes go
//! out as binary frames, inbound non-JSON binary frames are queued for
//! `read_byte`. Methods block on the runtime handle, so call them from a
//! plain thread or `spawn_blocking`, never from inside an async task.

use crate::error::{Error, Result};
use crate::infrastructure::bridge::BridgeSession;
use crate::infrastructure::transport::{window, TransportChannel};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

pub struct RelayChannel {
    session: Arc<BridgeSession>,
    handle: Handle,
    read_timeout: Duration,
    inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    pending: VecDeque<u8>,
}

impl RelayChannel {
    pub fn new(session: Arc<BridgeSession>, handle: Handle, read_timeout: Duration) -> Self {
        Self {
            session,
            handle,
            read_timeout,
            inbound: None,
            pending: VecDeque::new(),
        }
    }

    pub fn session(&self) -> &Arc<BridgeSession> {
        &self.session
    }

    fn drain_ready(&mut self) {
        if let Some(inbound) = self.inbound.as_mut() {
            while let Ok(frame) = inbound.try_recv() {
                self.pending.extend(frame);
            }
        }
    }
}

impl TransportChannel for RelayChannel {
    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.session.set_binary_tap(Some(tx));
        self.inbound = Some(rx);
        self.pending.clear();

        if let Err(e) = self.handle.block_on(self.session.connect()) {
            self.session.set_binary_tap(None);
            self.inbound = None;
            return Err(e);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.session.set_binary_tap(None);
        self.inbound = None;
        self.pending.clear();
        self.handle.block_on(self.session.disconnect());
    }

    fn read_byte(&mut self) -> Result<u8> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(byte);
        }
        self.drain_ready();
        if let Some(byte) = self.pending.pop_front() {
            return Ok(byte);
        }
        if !self.session.is_connected() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "relay session is not connected",
            )));
        }

        let read_timeout = self.read_timeout;
        let inbound = self.inbound.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "relay channel streams are not bound",
            ))
        })?;
        let frame = self
            .handle
            .block_on(async { tokio::time::timeout(read_timeout, inbound.recv()).await });
        match frame {
            Ok(Some(frame)) => {
                self.pending.extend(frame);
                self.pending.pop_front().ok_or_else(|| {
                    Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "empty relay frame"))
                })
            }
            Ok(None) => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "relay data plane closed",
            ))),
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no relay data within {} ms", read_timeout.as_millis()),
            ))),
        }
    }

    fn write_bytes(&mut self, buffer: &[u8], offset: usize, length: usize) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        let bytes = window(buffer, offset, length)?.to_vec();
        self.handle.block_on(self.session.send_binary(bytes))
    }

    fn flush(&mut self) -> Result<()> {
        // Each write is already a complete frame
        Ok(())
    }

    fn flush_input(&mut self) -> Result<()> {
        self.drain_ready();
        if !self.pending.is_empty() {
            debug!("Discarding {} queued relay bytes", self.pending.len());
        }
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inbound.is_some() && self.session.is_connected()
    }

    fn target(&self) -> &str {
        self.session.url()
    }
}
