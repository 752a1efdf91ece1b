//! Serial port channel

use crate::error::{Error, Result};
use crate::infrastructure::transport::establish::{
    AdapterControl, EstablishOptions, LinkSocket, LinkStrategy, LocalChannel, LocalKind,
};
use crate::infrastructure::transport::ConnectionGate;
use parking_lot::Mutex;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build a serial [`LocalChannel`] for `port_name`.
pub fn serial_channel(
    port_name: &str,
    baud_rate: u32,
    read_timeout: Duration,
    gate: ConnectionGate,
    options: EstablishOptions,
) -> LocalChannel {
    LocalChannel::new(
        LocalKind::Serial,
        port_name,
        gate,
        Arc::new(SerialPortCheck {
            port_name: port_name.to_string(),
        }),
        vec![Box::new(SerialStrategy {
            port_name: port_name.to_string(),
            baud_rate,
            read_timeout,
        })],
        options,
    )
}

struct SerialPortCheck {
    port_name: String,
}

impl AdapterControl for SerialPortCheck {
    fn ensure_available(&self) -> Result<()> {
        if self.port_name.trim().is_empty() {
            return Err(Error::InvalidAddress("empty serial port name".into()));
        }
        #[cfg(unix)]
        {
            let node = std::path::Path::new(&self.port_name);
            if self.port_name.starts_with("/dev/") && !node.exists() {
                return Err(Error::AdapterUnavailable(format!(
                    "serial port {} not present",
                    self.port_name
                )));
            }
        }
        Ok(())
    }
}

struct SerialStrategy {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl LinkStrategy for SerialStrategy {
    fn name(&self) -> &str {
        "serial"
    }

    fn create_socket(&self) -> io::Result<Arc<dyn LinkSocket>> {
        Ok(Arc::new(SerialSocket {
            port_name: self.port_name.clone(),
            baud_rate: self.baud_rate,
            read_timeout: self.read_timeout,
            port: Mutex::new(None),
        }))
    }
}

struct SerialSocket {
    port_name: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Mutex<Option<Box<dyn SerialPort>>>,
}

impl LinkSocket for SerialSocket {
    fn connect(&self) -> io::Result<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout)
            .open()?;

        info!("Opened serial port: {} at {} baud", self.port_name, self.baud_rate);
        *self.port.lock() = Some(port);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.lock().is_some()
    }

    fn close(&self) {
        self.port.lock().take();
    }

    fn streams(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let guard = self.port.lock();
        let port = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;
        let reader = port.try_clone()?;
        let writer = port.try_clone()?;
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn clear_input(&self) -> io::Result<()> {
        if let Some(port) = self.port.lock().as_ref() {
            port.clear(ClearBuffer::Input)?;
        }
        Ok(())
    }
}
