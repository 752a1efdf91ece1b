//! Infrastructure Module
//!
//! ## Modules
//!
//! - [`transport`] - Byte channels (serial, RFCOMM, relay) and the connection gate
//! - [`bridge`] - Relay WebSocket session and control protocol
//! - [`driver`] - Contract for the consumer-supplied firmware driver
//! - [`board`] - Expansion board detection
//! - [`logging`] - Tracing subscriber setup

pub mod board;
pub mod bridge;
pub mod driver;
pub mod logging;
pub mod transport;
