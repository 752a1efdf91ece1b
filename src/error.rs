//! Error types for the sensor link
//!
//! Variants map onto the hard/soft failure split used across the crate:
//! hard failures abort the operation and reach the caller, soft failures are
//! logged by the component that hit them and never leave it.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Adapter or port is missing, powered off or disabled
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Target address could not be parsed
    #[error("Invalid target address: {0}")]
    InvalidAddress(String),

    /// Every connection strategy failed; carries the last underlying cause
    #[error("Could not connect to {target}: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Relay handshake step failed (negative ack or timeout)
    #[error("Relay handshake failed at {step}: {reason}")]
    Handshake { step: &'static str, reason: String },

    /// Operation needs an open connection
    #[error("Not connected")]
    NotConnected,

    /// Legacy firmware driver rejected a command
    #[error("Driver error: {0}")]
    Driver(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed JSON on the relay control plane
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl Error {
    /// Hard failures abort the session operation that produced them.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Error::AdapterUnavailable(_)
                | Error::InvalidAddress(_)
                | Error::ConnectFailed { .. }
                | Error::Handshake { .. }
        )
    }

    /// Configuration errors fail fast, before any connection attempt.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::AdapterUnavailable(_) | Error::InvalidAddress(_))
    }
}
