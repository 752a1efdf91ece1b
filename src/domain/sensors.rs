//! Sensor Configuration
//!
//! Per-family enable flags and range selections, plus their two wire
//! renderings: the firmware `WriteSensors` bitmap for local links and the
//! nine boolean toggles the relay expects in `set_config`.

use serde::{Deserialize, Serialize};

/// Firmware sensor bitmap bits
pub mod bitmap {
    pub const EXT_A6: u32 = 0x00_0001;
    pub const EXT_A7: u32 = 0x00_0002;
    pub const EXG2_24BIT: u32 = 0x00_0008;
    pub const EXG1_24BIT: u32 = 0x00_0010;
    pub const MAG: u32 = 0x00_0020;
    pub const GYRO: u32 = 0x00_0040;
    pub const LOW_NOISE_ACCEL: u32 = 0x00_0080;
    pub const EXT_A15: u32 = 0x00_0800;
    pub const WIDE_RANGE_ACCEL: u32 = 0x00_1000;
    pub const BATTERY: u32 = 0x00_2000;
    pub const PRESSURE: u32 = 0x04_0000;
}

/// EXG chip configuration registers (one block per chip)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExgConfiguration {
    pub chip1: Vec<u8>,
    pub chip2: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_true")]
    pub low_noise_accel: bool,
    #[serde(default)]
    pub wide_range_accel: bool,
    #[serde(default = "default_true")]
    pub gyro: bool,
    #[serde(default = "default_true")]
    pub mag: bool,
    #[serde(default)]
    pub pressure_temperature: bool,
    #[serde(default = "default_true")]
    pub battery: bool,
    #[serde(default)]
    pub ext_a6: bool,
    #[serde(default)]
    pub ext_a7: bool,
    #[serde(default)]
    pub ext_a15: bool,
    #[serde(default)]
    pub exg: bool,

    // Range selections (firmware indices)
    #[serde(default)]
    pub accel_range: u8,
    #[serde(default)]
    pub gyro_range: u8,
    #[serde(default = "default_mag_range")]
    pub mag_range: u8,

    // Low-power toggles
    #[serde(default)]
    pub low_power_accel: bool,
    #[serde(default)]
    pub low_power_gyro: bool,
    #[serde(default)]
    pub low_power_mag: bool,

    #[serde(default)]
    pub exg_configuration: Option<ExgConfiguration>,
    #[serde(default)]
    pub internal_expansion_power: bool,
}

fn default_true() -> bool {
    true
}
fn default_mag_range() -> u8 {
    1
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            low_noise_accel: true,
            wide_range_accel: false,
            gyro: true,
            mag: true,
            pressure_temperature: false,
            battery: true,
            ext_a6: false,
            ext_a7: false,
            ext_a15: false,
            exg: false,
            accel_range: 0,
            gyro_range: 0,
            mag_range: default_mag_range(),
            low_power_accel: false,
            low_power_gyro: false,
            low_power_mag: false,
            exg_configuration: None,
            internal_expansion_power: false,
        }
    }
}

impl SensorConfig {
    /// Bitmap for the firmware `WriteSensors` command.
    ///
    /// EXG bits are only set when EXG is enabled and register bytes exist;
    /// the firmware rejects EXG streaming on an unconfigured chip.
    pub fn sensor_bitmap(&self) -> u32 {
        let mut bits = 0;
        let flags = [
            (self.low_noise_accel, bitmap::LOW_NOISE_ACCEL),
            (self.wide_range_accel, bitmap::WIDE_RANGE_ACCEL),
            (self.gyro, bitmap::GYRO),
            (self.mag, bitmap::MAG),
            (self.pressure_temperature, bitmap::PRESSURE),
            (self.battery, bitmap::BATTERY),
            (self.ext_a6, bitmap::EXT_A6),
            (self.ext_a7, bitmap::EXT_A7),
            (self.ext_a15, bitmap::EXT_A15),
        ];
        for (enabled, bit) in flags {
            if enabled {
                bits |= bit;
            }
        }
        if self.exg && self.exg_configuration.is_some() {
            bits |= bitmap::EXG1_24BIT | bitmap::EXG2_24BIT;
        }
        bits
    }

    pub fn relay_toggles(&self) -> SensorToggles {
        SensorToggles {
            enable_low_noise_accelerometer: self.low_noise_accel,
            enable_wide_range_accelerometer: self.wide_range_accel,
            enable_gyroscope: self.gyro,
            enable_magnetometer: self.mag,
            enable_pressure_temperature: self.pressure_temperature,
            enable_battery: self.battery,
            enable_ext_a6: self.ext_a6,
            enable_ext_a7: self.ext_a7,
            enable_ext_a15: self.ext_a15,
        }
    }
}

/// The nine sensor toggles carried by the relay `set_config` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorToggles {
    pub enable_low_noise_accelerometer: bool,
    pub enable_wide_range_accelerometer: bool,
    pub enable_gyroscope: bool,
    pub enable_magnetometer: bool,
    pub enable_pressure_temperature: bool,
    pub enable_battery: bool,
    #[serde(rename = "EnableExtA6")]
    pub enable_ext_a6: bool,
    #[serde(rename = "EnableExtA7")]
    pub enable_ext_a7: bool,
    #[serde(rename = "EnableExtA15")]
    pub enable_ext_a15: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bitmap() {
        let bits = SensorConfig::default().sensor_bitmap();
        assert_eq!(
            bits,
            bitmap::LOW_NOISE_ACCEL | bitmap::GYRO | bitmap::MAG | bitmap::BATTERY
        );
    }

    #[test]
    fn test_exg_bits_need_configuration_bytes() {
        let mut config = SensorConfig {
            exg: true,
            ..Default::default()
        };
        assert_eq!(config.sensor_bitmap() & bitmap::EXG1_24BIT, 0);

        config.exg_configuration = Some(ExgConfiguration {
            chip1: vec![0x00; 10],
            chip2: vec![0x00; 10],
        });
        let bits = config.sensor_bitmap();
        assert_ne!(bits & bitmap::EXG1_24BIT, 0);
        assert_ne!(bits & bitmap::EXG2_24BIT, 0);
    }

    #[test]
    fn test_relay_toggle_field_names() {
        let json = serde_json::to_value(SensorConfig::default().relay_toggles()).unwrap();
        assert_eq!(json["EnableLowNoiseAccelerometer"], true);
        assert_eq!(json["EnableWideRangeAccelerometer"], false);
        assert_eq!(json["EnableExtA15"], false);
        assert_eq!(json.as_object().unwrap().len(), 9);
    }
}
