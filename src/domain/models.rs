use serde::{Deserialize, Serialize};

/// Three-axis reading in calibrated units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One decoded sample. Every channel group is independently optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Device timestamp (non-negative)
    pub timestamp: u64,

    // Motion sensors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_noise_accel: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wide_range_accel: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gyro: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mag: Option<Vec3>,

    // Environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,

    /// Battery voltage in volts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,

    // Auxiliary ADC channels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_a6: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_a7: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_a15: Option<f64>,
}

impl SampleRecord {
    /// True when at least one channel holds a value. Records failing this
    /// are never forwarded to subscribers.
    pub fn has_data(&self) -> bool {
        self.low_noise_accel.is_some()
            || self.wide_range_accel.is_some()
            || self.gyro.is_some()
            || self.mag.is_some()
            || self.temperature.is_some()
            || self.pressure.is_some()
            || self.battery_voltage.is_some()
            || self.ext_a6.is_some()
            || self.ext_a7.is_some()
            || self.ext_a15.is_some()
    }
}

/// Expansion board fitted to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoardKind {
    #[default]
    Unknown,
    Exg,
    Imu,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoardDetectionResult {
    pub kind: BoardKind,
    pub raw_id: Option<String>,
}

impl BoardDetectionResult {
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Classify a board identifier string. Empty input is Unknown.
    pub fn classify(raw_id: &str) -> Self {
        let trimmed = raw_id.trim();
        if trimmed.is_empty() {
            return Self::unknown();
        }
        let kind = if trimmed.to_ascii_uppercase().contains("EXG") {
            BoardKind::Exg
        } else {
            BoardKind::Imu
        };
        Self {
            kind,
            raw_id: Some(trimmed.to_string()),
        }
    }

    pub fn ok(&self) -> bool {
        self.kind != BoardKind::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Session-level notifications published alongside the sample stream
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    Log(StatusMessage),
    BoardDetected(BoardDetectionResult),
    /// Relay reported its authoritative configuration
    ConfigChanged(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_record_has_no_data() {
        assert!(!SampleRecord::default().has_data());
    }

    #[test]
    fn test_battery_only_record_has_data() {
        let record = SampleRecord {
            battery_voltage: Some(3.7),
            ..Default::default()
        };
        assert!(record.has_data());
    }

    #[test]
    fn test_board_classification() {
        assert_eq!(BoardDetectionResult::classify("IMU_BRD_V2").kind, BoardKind::Imu);
        assert_eq!(
            BoardDetectionResult::classify("SHIMMER_EXG_UNIFIED").kind,
            BoardKind::Exg
        );
        assert_eq!(BoardDetectionResult::classify("shimmer exg").kind, BoardKind::Exg);

        let empty = BoardDetectionResult::classify("  ");
        assert_eq!(empty.kind, BoardKind::Unknown);
        assert!(!empty.ok());
        assert_eq!(empty.raw_id, None);
    }
}
