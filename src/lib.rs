//! Transport and protocol layer for Shimmer wearable sensors.
//!
//! Connects over a serial port, Bluetooth RFCOMM, or a relay reached through
//! a WebSocket bridge, and delivers decoded [`SampleRecord`]s to subscribers
//! of a [`SensorService`].

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod service;

pub use domain::models::{BoardDetectionResult, BoardKind, SampleRecord, SessionEvent};
pub use error::{Error, Result};
pub use service::{ChannelFactory, DriverFactory, SampleBus, SensorService, Subscription};
