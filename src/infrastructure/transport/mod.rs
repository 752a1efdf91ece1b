//! Transport Module
//!
//! Byte-level channels to the sensor device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   TransportChannel                       │
//! │   open / close / read_byte / write_bytes / flush ...     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         │                           │
//!         ▼                           ▼
//! ┌────────────────┐          ┌──────────────┐
//! │  LocalChannel  │          │ RelayChannel │
//! │                │          │              │
//! │ - serial       │          │ - binary     │
//! │ - RFCOMM       │          │   frames over│
//! │ (strategies +  │          │   the bridge │
//! │  gate)         │          │   session    │
//! └────────────────┘          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gate`] - Process-wide serialization of connection attempts
//! - [`establish`] - Ordered, timed, fallback connection strategy
//! - [`serial`] - Serial port strategy
//! - [`rfcomm`] - Bluetooth Classic RFCOMM strategies
//! - [`relay`] - Byte channel emulated over the relay bridge

pub mod establish;
pub mod gate;
pub mod relay;
pub mod rfcomm;
pub mod serial;

pub use establish::{LocalChannel, LocalKind};
pub use gate::ConnectionGate;
pub use relay::RelayChannel;

use crate::error::Result;

/// Uniform byte-level capability offered by every channel.
///
/// A channel assumes a single reader and a single writer, both owned by the
/// driver that holds it.
pub trait TransportChannel: Send {
    /// Connect. No-op when already open.
    fn open(&mut self) -> Result<()>;

    /// Best-effort teardown. Safe before `open` and safe to repeat.
    fn close(&mut self);

    /// Blocking read of one byte. End-of-stream and unbound streams are
    /// errors, never a sentinel value.
    fn read_byte(&mut self) -> Result<u8>;

    /// Write `buffer[offset..offset + length]` and flush it onto the wire.
    fn write_bytes(&mut self, buffer: &[u8], offset: usize, length: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Discard buffered inbound bytes where the channel has such a buffer.
    fn flush_input(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Target address for logs and errors
    fn target(&self) -> &str;
}

/// Validate an `(offset, length)` window against a buffer.
pub(crate) fn window(buffer: &[u8], offset: usize, length: usize) -> std::io::Result<&[u8]> {
    offset
        .checked_add(length)
        .and_then(|end| buffer.get(offset..end))
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "write window {}+{} outside buffer of {} bytes",
                    offset,
                    length,
                    buffer.len()
                ),
            )
        })
}
