//! Scripted in-process modems.
//!
//! [`MockModem`] implements [`LinkProvider`] over a table of fake devices. Each device
//! answers commands from a per-command script, optionally after a latency, and every
//! session and exchange is recorded with timestamps so tests can check ordering and
//! exclusivity. Used by the test suites and by builds without the `serial` feature.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::link::{LinkProvider, OpenError, PortInfo, SerialLink};

/// Bytes handed out per `receive` call, so responses arrive in several chunks.
const CHUNK: usize = 16;

#[derive(Debug, Clone)]
struct MockDevice {
    description: String,
    present: bool,
    open_error: Option<OpenError>,
    latency: Duration,
    script: HashMap<String, String>,
}

/// One command sent to a device, with when it was written and fully answered.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub port: String,
    pub command: String,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// One open/close cycle of a device.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub port: String,
    pub opened: Instant,
    pub closed: Option<Instant>,
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<String, MockDevice>,
    enumerate_error: Option<String>,
    exchanges: Vec<ExchangeRecord>,
    sessions: Vec<SessionRecord>,
    open_attempts: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MockModem {
    state: Arc<Mutex<MockState>>,
}

impl MockModem {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plug in a device that answers nothing until scripted.
    pub fn add_port(&self, port: &str, description: &str) {
        self.state().devices.insert(
            port.to_string(),
            MockDevice {
                description: description.to_string(),
                present: true,
                open_error: None,
                latency: Duration::ZERO,
                script: HashMap::new(),
            },
        );
    }

    /// Plug in a USB modem holding a ready SIM with the given ICCID and IMSI.
    /// The SIM reports itself as still searching for a network until scripted.
    pub fn add_sim_modem(&self, port: &str, iccid: &str, imsi: &str) {
        self.add_port(port, "USB Serial Device (Quectel)");
        self.respond(port, "AT", "\r\nOK\r\n");
        self.respond(port, "AT+CPIN?", "+CPIN: READY\r\n\r\nOK\r\n");
        self.respond(port, "AT+CREG?", "+CREG: 0,2\r\n\r\nOK\r\n");
        self.respond(port, "AT+COPS?", "+COPS: 0,0,\"Viettel\",7\r\n\r\nOK\r\n");
        self.respond(port, "AT+CSQ", "+CSQ: 21,99\r\n\r\nOK\r\n");
        self.respond(port, "AT+CCID", &format!("+CCID: {}\r\n\r\nOK\r\n", iccid));
        self.respond(port, "AT+CIMI", &format!("{}\r\n\r\nOK\r\n", imsi));
        self.respond(
            port,
            "AT+QNWINFO",
            "+QNWINFO: \"FDD LTE\",\"45204\",\"LTE BAND 3\",1300\r\n\r\nOK\r\n",
        );
    }

    /// Script the reply to a command (exact match, without the trailing `\r`).
    pub fn respond(&self, port: &str, command: &str, reply: &str) {
        if let Some(dev) = self.state().devices.get_mut(port) {
            dev.script.insert(command.to_string(), reply.to_string());
        }
    }

    /// Make a command go unanswered.
    pub fn silence(&self, port: &str, command: &str) {
        if let Some(dev) = self.state().devices.get_mut(port) {
            dev.script.remove(command);
        }
    }

    pub fn set_latency(&self, port: &str, latency: Duration) {
        if let Some(dev) = self.state().devices.get_mut(port) {
            dev.latency = latency;
        }
    }

    pub fn fail_open(&self, port: &str, error: Option<OpenError>) {
        if let Some(dev) = self.state().devices.get_mut(port) {
            dev.open_error = error;
        }
    }

    /// Remove the device from enumeration; opening it reports `NotFound`.
    pub fn unplug(&self, port: &str) {
        if let Some(dev) = self.state().devices.get_mut(port) {
            dev.present = false;
        }
    }

    pub fn fail_enumeration(&self, reason: Option<&str>) {
        self.state().enumerate_error = reason.map(str::to_string);
    }

    pub fn exchanges(&self) -> Vec<ExchangeRecord> {
        self.state().exchanges.clone()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state().sessions.clone()
    }

    /// Commands written to a port, in order.
    pub fn commands_sent(&self, port: &str) -> Vec<String> {
        self.state()
            .exchanges
            .iter()
            .filter(|e| e.port == port)
            .map(|e| e.command.clone())
            .collect()
    }

    pub fn open_attempts(&self, port: &str) -> u32 {
        self.state().open_attempts.get(port).copied().unwrap_or(0)
    }
}

impl LinkProvider for MockModem {
    fn enumerate(&self) -> io::Result<Vec<PortInfo>> {
        let state = self.state();
        if let Some(reason) = &state.enumerate_error {
            return Err(io::Error::new(io::ErrorKind::Other, reason.clone()));
        }
        let mut ports: Vec<PortInfo> = state
            .devices
            .iter()
            .filter(|(_, d)| d.present)
            .map(|(path, d)| PortInfo::new(path.clone(), d.description.clone()))
            .collect();
        ports.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        Ok(ports)
    }

    fn open(&self, port_id: &str, _baud_rate: u32) -> Result<Box<dyn SerialLink>, OpenError> {
        let mut state = self.state();
        *state.open_attempts.entry(port_id.to_string()).or_insert(0) += 1;
        let device = match state.devices.get(port_id) {
            Some(d) if d.present => d,
            _ => return Err(OpenError::NotFound(port_id.to_string())),
        };
        if let Some(err) = &device.open_error {
            return Err(err.clone());
        }
        state.sessions.push(SessionRecord {
            port: port_id.to_string(),
            opened: Instant::now(),
            closed: None,
        });
        let session = state.sessions.len() - 1;
        Ok(Box::new(MockLink {
            modem: self.clone(),
            port: port_id.to_string(),
            session,
            pending: Vec::new(),
            ready_at: Instant::now(),
            exchange: None,
        }))
    }
}

struct MockLink {
    modem: MockModem,
    port: String,
    session: usize,
    pending: Vec<u8>,
    ready_at: Instant,
    exchange: Option<usize>,
}

impl SerialLink for MockLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let command = String::from_utf8_lossy(data).trim_end_matches('\r').to_string();
        let mut state = self.modem.state();
        let device = state
            .devices
            .get(&self.port)
            .filter(|d| d.present)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))?;
        state.exchanges.push(ExchangeRecord {
            port: self.port.clone(),
            command: command.clone(),
            started: Instant::now(),
            finished: None,
        });
        self.exchange = Some(state.exchanges.len() - 1);
        self.pending = device
            .script
            .get(&command)
            .map(|r| r.as_bytes().to_vec())
            .unwrap_or_default();
        self.ready_at = Instant::now() + device.latency;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() || Instant::now() < self.ready_at {
            return Ok(0);
        }
        let n = self.pending.len().min(CHUNK).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        if self.pending.is_empty() {
            if let Some(idx) = self.exchange.take() {
                if let Some(rec) = self.modem.state().exchanges.get_mut(idx) {
                    rec.finished = Some(Instant::now());
                }
            }
        }
        Ok(n)
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        if let Some(rec) = self.modem.state().sessions.get_mut(self.session) {
            rec.closed = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reply_arrives_in_chunks() {
        let modem = MockModem::new();
        modem.add_sim_modem("/dev/ttyUSB0", "8984012345678901234", "452040123456789");
        let mut link = modem.open("/dev/ttyUSB0", 115200).unwrap();
        link.send(b"AT+CPIN?\r").unwrap();
        let mut buf = [0u8; 64];
        let mut text = Vec::new();
        loop {
            let n = link.receive(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= CHUNK);
            text.extend_from_slice(&buf[..n]);
        }
        assert_eq!(String::from_utf8(text).unwrap(), "+CPIN: READY\r\n\r\nOK\r\n");
        assert_eq!(modem.commands_sent("/dev/ttyUSB0"), vec!["AT+CPIN?"]);
    }

    #[test]
    fn unplugged_port_is_not_found() {
        let modem = MockModem::new();
        modem.add_port("/dev/ttyUSB1", "USB");
        modem.unplug("/dev/ttyUSB1");
        assert!(modem.enumerate().unwrap().is_empty());
        assert!(matches!(modem.open("/dev/ttyUSB1", 115200), Err(OpenError::NotFound(_))));
    }

    #[test]
    fn sessions_record_close_on_drop() {
        let modem = MockModem::new();
        modem.add_port("/dev/ttyUSB2", "USB");
        drop(modem.open("/dev/ttyUSB2", 115200).unwrap());
        let sessions = modem.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].closed.is_some());
    }
}
