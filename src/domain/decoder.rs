//! Sample Decoding
//!
//! Normalizes the three shapes a sample can arrive in into a [`SampleRecord`]:
//! relay `sample` JSON messages, the raw 10-byte binary frame, and the named
//! signal clusters produced by the legacy firmware driver.
//!
//! Every decoder returns `None` for a record that carries no channel at all,
//! so callers can forward whatever comes back without re-checking.

use crate::domain::models::{SampleRecord, Vec3};
use serde_json::Value;
use tracing::trace;

/// Length of the raw binary fallback frame
pub const RAW_FRAME_LEN: usize = 10;

/// Raw accelerometer counts per g
pub const RAW_ACCEL_SCALE: f64 = 16384.0;

/// Decode a relay `sample` message.
///
/// ```text
/// {"type":"sample","ts":123.0,"lna":{"x":..,"y":..,"z":..},"wra":{..},
///  "gyro":{..},"mag":{..},"temp":..,"press":..,"vbatt":..,
///  "ext":{"a6":..,"a7":..,"a15":..}}
/// ```
pub fn decode_json_sample(msg: &Value) -> Option<SampleRecord> {
    let ext = msg.get("ext");
    let record = SampleRecord {
        timestamp: timestamp_from(msg.get("ts")),
        low_noise_accel: vec3_from(msg.get("lna")),
        wide_range_accel: vec3_from(msg.get("wra")),
        gyro: vec3_from(msg.get("gyro")),
        mag: vec3_from(msg.get("mag")),
        temperature: number(msg.get("temp")),
        pressure: number(msg.get("press")),
        battery_voltage: number(msg.get("vbatt")),
        ext_a6: number(ext.and_then(|e| e.get("a6"))),
        ext_a7: number(ext.and_then(|e| e.get("a7"))),
        ext_a15: number(ext.and_then(|e| e.get("a15"))),
    };

    if record.has_data() {
        Some(record)
    } else {
        trace!("Dropping sample without channels");
        None
    }
}

/// Decode the raw binary fallback frame
///
/// # Frame Structure (10 bytes)
///
/// ```text
/// [0-3] : Timestamp (u32 little-endian)
/// [4-5] : Accel X (i16 little-endian)
/// [6-7] : Accel Y
/// [8-9] : Accel Z
/// ```
///
/// Shorter frames are incomplete and dropped without error.
pub fn decode_raw_frame(bytes: &[u8]) -> Option<SampleRecord> {
    if bytes.len() < RAW_FRAME_LEN {
        trace!("Dropping incomplete raw frame ({} bytes)", bytes.len());
        return None;
    }

    let timestamp = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64;
    let axis = |i: usize| i16::from_le_bytes([bytes[i], bytes[i + 1]]) as f64 / RAW_ACCEL_SCALE;

    Some(SampleRecord {
        timestamp,
        low_noise_accel: Some(Vec3::new(axis(4), axis(6), axis(8))),
        ..Default::default()
    })
}

/// Decode a cluster of `(signal name, calibrated value)` pairs as emitted by
/// the firmware driver. Unknown names are ignored.
pub fn decode_signal_cluster<'a, I>(signals: I) -> Option<SampleRecord>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut record = SampleRecord::default();
    let mut lna = Axes::default();
    let mut wra = Axes::default();
    let mut gyro = Axes::default();
    let mut mag = Axes::default();

    for (name, value) in signals {
        if !value.is_finite() {
            continue;
        }
        match name {
            "Timestamp" => record.timestamp = clamp_timestamp(value),
            "Low Noise Accelerometer X" => lna.x = Some(value),
            "Low Noise Accelerometer Y" => lna.y = Some(value),
            "Low Noise Accelerometer Z" => lna.z = Some(value),
            "Wide Range Accelerometer X" => wra.x = Some(value),
            "Wide Range Accelerometer Y" => wra.y = Some(value),
            "Wide Range Accelerometer Z" => wra.z = Some(value),
            "Gyroscope X" => gyro.x = Some(value),
            "Gyroscope Y" => gyro.y = Some(value),
            "Gyroscope Z" => gyro.z = Some(value),
            "Magnetometer X" => mag.x = Some(value),
            "Magnetometer Y" => mag.y = Some(value),
            "Magnetometer Z" => mag.z = Some(value),
            "Temperature" => record.temperature = Some(value),
            "Pressure" => record.pressure = Some(value),
            // Driver reports millivolts
            "VSenseBatt" => {
                record.battery_voltage = Some(if value > 100.0 { value / 1000.0 } else { value })
            }
            "External ADC A6" => record.ext_a6 = Some(value),
            "External ADC A7" => record.ext_a7 = Some(value),
            "External ADC A15" => record.ext_a15 = Some(value),
            _ => {}
        }
    }

    record.low_noise_accel = lna.complete();
    record.wide_range_accel = wra.complete();
    record.gyro = gyro.complete();
    record.mag = mag.complete();

    record.has_data().then_some(record)
}

#[derive(Default)]
struct Axes {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
}

impl Axes {
    fn complete(&self) -> Option<Vec3> {
        Some(Vec3::new(self.x?, self.y?, self.z?))
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn vec3_from(value: Option<&Value>) -> Option<Vec3> {
    let group = value?;
    Some(Vec3::new(
        number(group.get("x"))?,
        number(group.get("y"))?,
        number(group.get("z"))?,
    ))
}

fn timestamp_from(value: Option<&Value>) -> u64 {
    number(value).map(clamp_timestamp).unwrap_or(0)
}

fn clamp_timestamp(ts: f64) -> u64 {
    ts.max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_frame() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&16384i16.to_le_bytes());
        bytes.extend_from_slice(&0i16.to_le_bytes());
        bytes.extend_from_slice(&(-16384i16).to_le_bytes());

        let record = decode_raw_frame(&bytes).unwrap();
        assert_eq!(record.timestamp, 100);
        assert_eq!(record.low_noise_accel, Some(Vec3::new(1.0, 0.0, -1.0)));
        assert!(record.gyro.is_none());
    }

    #[test]
    fn test_short_raw_frame_dropped() {
        assert!(decode_raw_frame(&[0u8; 9]).is_none());
        assert!(decode_raw_frame(&[]).is_none());
    }

    #[test]
    fn test_json_sample_full() {
        let msg = json!({
            "type": "sample",
            "ts": 1523.9,
            "lna": {"x": 0.1, "y": 0.2, "z": 9.8},
            "gyro": {"x": 1, "y": 2, "z": 3},
            "temp": 24.5,
            "press": 101.3,
            "vbatt": 3.9,
            "ext": {"a6": 0.5, "a15": 1.25}
        });
        let record = decode_json_sample(&msg).unwrap();
        assert_eq!(record.timestamp, 1523);
        assert_eq!(record.gyro, Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(record.ext_a6, Some(0.5));
        assert_eq!(record.ext_a7, None);
        assert_eq!(record.ext_a15, Some(1.25));
        assert!(record.mag.is_none());
        assert!(record.wide_range_accel.is_none());
    }

    #[test]
    fn test_json_sample_negative_timestamp_clamped() {
        let record = decode_json_sample(&json!({"ts": -42.0, "temp": 20.0})).unwrap();
        assert_eq!(record.timestamp, 0);
    }

    #[test]
    fn test_json_sample_without_channels_dropped() {
        assert!(decode_json_sample(&json!({"type": "sample", "ts": 5})).is_none());
        // Non-numeric values don't count as channels
        assert!(decode_json_sample(&json!({"ts": 5, "temp": "hot", "lna": {"x": 1}})).is_none());
    }

    #[test]
    fn test_json_battery_only_forwarded() {
        let record = decode_json_sample(&json!({"type": "sample", "vbatt": 3.7})).unwrap();
        assert_eq!(record.battery_voltage, Some(3.7));
    }

    #[test]
    fn test_signal_cluster() {
        let signals = [
            ("Timestamp", 2048.0),
            ("Gyroscope X", 0.5),
            ("Gyroscope Y", -0.5),
            ("Gyroscope Z", 0.0),
            ("Magnetometer X", 1.0),
            ("VSenseBatt", 3712.0),
            ("Internal ADC A13", 1.0),
        ];
        let record = decode_signal_cluster(signals).unwrap();
        assert_eq!(record.timestamp, 2048);
        assert_eq!(record.gyro, Some(Vec3::new(0.5, -0.5, 0.0)));
        // Partial group is not reported
        assert!(record.mag.is_none());
        assert!((record.battery_voltage.unwrap() - 3.712).abs() < 1e-9);
    }

    #[test]
    fn test_signal_cluster_without_channels() {
        assert!(decode_signal_cluster([("Timestamp", 1.0)]).is_none());
    }
}
