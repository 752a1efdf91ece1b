//! Firmware Driver Contract
//!
//! The legacy firmware-command driver is supplied by the consumer. It owns a
//! [`TransportChannel`](crate::infrastructure::transport::TransportChannel)
//! and speaks the device's command set; this crate only sequences it.
//!
//! Board identification is reached one of two ways:
//!
//! ```text
//! FirmwareDriver
//!   ├─ expansion_board() ─► ExpansionBoard        (stable interface)
//!   └─ inspect_root()    ─► Inspect ─► ... ─► BoardIdentity
//!                                             (structural discovery)
//! ```

use crate::error::Result;
use std::sync::Arc;

/// Which calibration blocks `read_calibration_parameters` fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationScope {
    All,
    LowNoiseAccel,
    WideRangeAccel,
    Gyro,
    Mag,
}

/// One decoded packet: `(signal name, calibrated value)` pairs
pub type SignalCluster = Vec<(String, f64)>;

pub trait FirmwareDriver: Send {
    /// Open the underlying channel
    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn inquiry(&mut self) -> Result<()>;

    fn firmware_version(&mut self) -> Result<String>;

    fn write_sampling_rate(&mut self, hz: f64) -> Result<()>;

    fn write_sensors(&mut self, bitmap: u32) -> Result<()>;

    fn write_accel_range(&mut self, range: u8) -> Result<()>;

    fn write_gyro_range(&mut self, range: u8) -> Result<()>;

    fn write_mag_range(&mut self, range: u8) -> Result<()>;

    fn write_low_power_accel(&mut self, enabled: bool) -> Result<()>;

    fn write_low_power_gyro(&mut self, enabled: bool) -> Result<()>;

    fn write_low_power_mag(&mut self, enabled: bool) -> Result<()>;

    /// Register bytes for EXG chip 1 or 2
    fn write_exg_configuration(&mut self, chip: u8, registers: &[u8]) -> Result<()>;

    fn write_internal_exp_power(&mut self, enabled: bool) -> Result<()>;

    fn read_calibration_parameters(&mut self, scope: CalibrationScope) -> Result<()>;

    fn start_streaming(&mut self) -> Result<()>;

    fn stop_streaming(&mut self) -> Result<()>;

    /// Next decoded packet. `None` when nothing arrived within the driver's
    /// read timeout.
    fn read_signals(&mut self) -> Result<Option<SignalCluster>>;

    fn expansion_board(&mut self) -> Option<&mut dyn ExpansionBoard> {
        None
    }

    /// Entry point for structural discovery
    fn inspect_root(&self) -> Option<Arc<dyn Inspect>> {
        None
    }
}

/// Stable expansion-board interface
pub trait ExpansionBoard {
    /// Ask the device to re-read its daughterboard id
    fn refresh(&mut self) -> Result<()>;

    fn board_id(&mut self) -> Result<String>;
}

/// Value of one reachable member during structural discovery
pub enum Member {
    Primitive,
    Text(String),
    Enum(String),
    Object(Arc<dyn Inspect>),
}

/// Structural view of an object inside a wrapped driver
pub trait Inspect: Send + Sync {
    fn type_name(&self) -> &str;

    fn members(&self) -> Vec<(String, Member)>;

    /// Present when this object has a parameterless board-id getter
    fn board_identity(&self) -> Option<&dyn BoardIdentity> {
        None
    }
}

pub trait BoardIdentity: Send + Sync {
    fn read_board_id(&self) -> Result<String>;

    /// No-op when the object has no refresh operation
    fn request_refresh(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum ReadFault {
        Error,
        Panic,
    }

    /// Scripted driver that records every command it receives
    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub log: Arc<Mutex<Vec<String>>>,
        pub connected: bool,
        pub refuse_connect: bool,
        pub fail_command: Option<&'static str>,
        pub signals: VecDeque<SignalCluster>,
        pub board: Option<FakeBoard>,
        /// One-shot fault raised once this many clusters were delivered
        pub read_fault: Option<(usize, ReadFault)>,
        pub delivered: usize,
    }

    impl FakeDriver {
        fn record(&mut self, command: &'static str) -> Result<()> {
            self.log.lock().push(command.to_string());
            if self.fail_command == Some(command) {
                return Err(Error::Driver(format!("{} rejected", command)));
            }
            Ok(())
        }
    }

    impl FirmwareDriver for FakeDriver {
        fn connect(&mut self) -> Result<()> {
            if self.refuse_connect {
                return Err(Error::AdapterUnavailable("adapter disabled".into()));
            }
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.log.lock().push("disconnect".to_string());
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn inquiry(&mut self) -> Result<()> {
            self.record("inquiry")
        }

        fn firmware_version(&mut self) -> Result<String> {
            self.record("firmware_version")?;
            Ok("LogAndStream v0.16.0".to_string())
        }

        fn write_sampling_rate(&mut self, _hz: f64) -> Result<()> {
            self.record("sampling_rate")
        }

        fn write_sensors(&mut self, _bitmap: u32) -> Result<()> {
            self.record("sensors")
        }

        fn write_accel_range(&mut self, _range: u8) -> Result<()> {
            self.record("accel_range")
        }

        fn write_gyro_range(&mut self, _range: u8) -> Result<()> {
            self.record("gyro_range")
        }

        fn write_mag_range(&mut self, _range: u8) -> Result<()> {
            self.record("mag_range")
        }

        fn write_low_power_accel(&mut self, _enabled: bool) -> Result<()> {
            self.record("low_power_accel")
        }

        fn write_low_power_gyro(&mut self, _enabled: bool) -> Result<()> {
            self.record("low_power_gyro")
        }

        fn write_low_power_mag(&mut self, _enabled: bool) -> Result<()> {
            self.record("low_power_mag")
        }

        fn write_exg_configuration(&mut self, chip: u8, _registers: &[u8]) -> Result<()> {
            self.record(if chip == 1 { "exg_chip1" } else { "exg_chip2" })
        }

        fn write_internal_exp_power(&mut self, _enabled: bool) -> Result<()> {
            self.record("exp_power")
        }

        fn read_calibration_parameters(&mut self, _scope: CalibrationScope) -> Result<()> {
            self.record("calibration")
        }

        fn start_streaming(&mut self) -> Result<()> {
            self.record("start")
        }

        fn stop_streaming(&mut self) -> Result<()> {
            self.record("stop")
        }

        fn read_signals(&mut self) -> Result<Option<SignalCluster>> {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            if let Some((after, fault)) = self.read_fault {
                if after == self.delivered {
                    self.read_fault = None;
                    match fault {
                        ReadFault::Error => {
                            return Err(Error::Driver("stream interrupted".into()))
                        }
                        ReadFault::Panic => panic!("corrupt packet"),
                    }
                }
            }
            match self.signals.pop_front() {
                Some(cluster) => {
                    self.delivered += 1;
                    Ok(Some(cluster))
                }
                None => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    Ok(None)
                }
            }
        }

        fn expansion_board(&mut self) -> Option<&mut dyn ExpansionBoard> {
            self.board.as_mut().map(|b| b as &mut dyn ExpansionBoard)
        }
    }

    pub(crate) struct FakeBoard {
        pub id: String,
        pub refreshed: usize,
    }

    impl ExpansionBoard for FakeBoard {
        fn refresh(&mut self) -> Result<()> {
            self.refreshed += 1;
            Ok(())
        }

        fn board_id(&mut self) -> Result<String> {
            Ok(self.id.clone())
        }
    }
}
