//! `serialport`-backed link provider for real modems.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, trace};
use serialport::{ClearBuffer, SerialPort, SerialPortType};

use super::link::{LinkProvider, OpenError, PortInfo, SerialLink};

/// Opens host serial ports with a short read timeout so an exchange can poll.
#[derive(Debug, Clone)]
pub struct SystemSerial {
    read_poll: Duration,
}

impl SystemSerial {
    pub fn new(read_poll: Duration) -> Self {
        Self { read_poll }
    }
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => {
            let mut desc = format!("USB VID:PID={:04X}:{:04X}", info.vid, info.pid);
            if let Some(product) = &info.product {
                desc.push(' ');
                desc.push_str(product);
            }
            if let Some(manufacturer) = &info.manufacturer {
                desc.push_str(" (");
                desc.push_str(manufacturer);
                desc.push(')');
            }
            desc
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

fn classify(port_id: &str, err: serialport::Error) -> OpenError {
    let detail = format!("{}: {}", port_id, err.description);
    match err.kind {
        serialport::ErrorKind::NoDevice => OpenError::NotFound(detail),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => OpenError::NotFound(detail),
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            OpenError::PermissionDenied(detail)
        }
        _ if err.description.to_ascii_lowercase().contains("busy") => OpenError::Busy(detail),
        _ => OpenError::Other(detail),
    }
}

impl LinkProvider for SystemSerial {
    fn enumerate(&self) -> io::Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.description))?;
        Ok(ports
            .into_iter()
            .map(|p| PortInfo::new(p.port_name, describe(&p.port_type)))
            .collect())
    }

    fn open(&self, port_id: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, OpenError> {
        let mut builder = serialport::new(port_id, baud_rate).timeout(self.read_poll);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let port = builder.open().map_err(|e| classify(port_id, e))?;
        debug!("Opened serial port {} at {} baud", port_id, baud_rate);
        Ok(Box::new(SystemLink { port }))
    }
}

struct SystemLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.description))
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => {
                if n > 0 {
                    trace!("RAW {} bytes", n);
                }
                Ok(n)
            }
            // Timeout is normal: nothing arrived within the poll window.
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_and_missing_device_are_classified() {
        let denied = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "Permission denied",
        );
        assert!(matches!(classify("/dev/ttyUSB0", denied), OpenError::PermissionDenied(_)));
        let gone = serialport::Error::new(serialport::ErrorKind::NoDevice, "No such device");
        assert!(matches!(classify("/dev/ttyUSB0", gone), OpenError::NotFound(_)));
        let busy = serialport::Error::new(serialport::ErrorKind::Unknown, "Device or resource busy");
        assert!(matches!(classify("/dev/ttyUSB0", busy), OpenError::Busy(_)));
    }
}
