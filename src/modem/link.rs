//! Host-side serial plumbing behind two small traits, so the AT channel can run
//! against real hardware ([`super::system::SystemSerial`]) or the scripted
//! [`super::mock::MockModem`].

use std::io;

use serde::Serialize;
use thiserror::Error;

/// A serial interface as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub device_path: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(device_path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            description: description.into(),
        }
    }

    /// Substring match on the description (`"USB"` for modem candidates).
    pub fn matches(&self, filter: &str) -> bool {
        self.description.contains(filter)
    }
}

/// Why a port could not be opened.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The device node is gone; never transient.
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("{0}")]
    Other(String),
}

/// One open serial endpoint. Reads are expected to return quickly (a short poll
/// timeout); `Ok(0)` means nothing arrived in that window.
pub trait SerialLink: Send {
    /// Drop anything the modem sent before the next command.
    fn clear_input(&mut self) -> io::Result<()>;
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Enumerates and opens serial interfaces.
pub trait LinkProvider: Send + Sync {
    fn enumerate(&self) -> io::Result<Vec<PortInfo>>;
    fn open(&self, port_id: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, OpenError>;
}
