//! Relay Bridge Module
//!
//! Reaches a device through a relay process over a WebSocket, for hosts
//! without Bluetooth Classic.
//!
//! ## Modules
//!
//! - [`protocol`] - JSON control messages
//! - [`ack`] - One pending acknowledgement per command kind
//! - [`session`] - Handshake state machine and receive loop

pub mod ack;
pub mod protocol;
pub mod session;

pub use protocol::ControlMessage;
pub use session::{BridgeConfig, BridgeSession, BridgeState, BridgeTimings, SampleHandler};
