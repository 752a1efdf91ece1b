use crate::domain::sensors::SensorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Smallest connect timeout accepted for a single strategy
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "shimmer_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Which channel reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    #[default]
    Bluetooth,
    Relay,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "bluetooth" | "bt" | "rfcomm" => Ok(Self::Bluetooth),
            "relay" | "bridge" | "ws" => Ok(Self::Relay),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Serial port name, Bluetooth MAC, or relay URL (`ws://host:port/path`)
    #[serde(default)]
    pub target: String,
    /// MAC announced to the relay in `open`/`start`
    #[serde(default)]
    pub relay_device_mac: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_rfcomm_channel")]
    pub rfcomm_channel: u8,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    #[serde(default)]
    pub sensors: SensorConfig,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            transport: TransportKind::default(),
            target: String::new(),
            relay_device_mac: String::new(),
            baud_rate: default_baud_rate(),
            rfcomm_channel: default_rfcomm_channel(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            sampling_rate: default_sampling_rate(),
            sensors: SensorConfig::default(),
        }
    }
}

impl DeviceSettings {
    /// Per-strategy connect timeout with the floor applied
    pub fn effective_connect_timeout_ms(&self) -> u64 {
        self.connect_timeout_ms.max(MIN_CONNECT_TIMEOUT_MS)
    }
}

fn default_device_id() -> String {
    "Shimmer".to_string()
}
fn default_baud_rate() -> u32 {
    115200
}
fn default_rfcomm_channel() -> u8 {
    1
}
fn default_connect_timeout_ms() -> u64 {
    8000
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_sampling_rate() -> f64 {
    51.2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub device: DeviceSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub known_devices: Vec<String>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit path; missing or corrupt files yield defaults.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ShimmerLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn add_known_device(&mut self, target: &str) -> anyhow::Result<()> {
        if !self.settings.known_devices.iter().any(|d| d == target) {
            self.settings.known_devices.push(target.to_string());
            self.save()?;
        }
        Ok(())
    }
}
