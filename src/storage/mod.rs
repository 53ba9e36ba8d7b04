//! # Device Registry
//!
//! Persistent records of every SIM seen by the bridge and of the SMS read from them.
//!
//! ## Records
//!
//! - [`SimRecord`] keyed by ICCID. Tracks the port the SIM currently sits in, every port
//!   it sat in before, the latest telemetry and the prepaid balance.
//! - [`SmsRecord`] keyed by `(imsi or iccid, sender, time)`. The modem's own message
//!   index is not stable across sessions, so it is informational only.
//!
//! ## Access
//!
//! Stores implement the narrow [`SimStore`] / [`SmsStore`] traits. Writes are upserts
//! applied atomically per key by the backend, so loops never read-modify-write a record
//! themselves. [`sled_store::SledStore`] is the embedded implementation and
//! [`repository::Registry`] wraps any pair of stores with the retry policy.

pub mod errors;
pub mod repository;
pub mod sled_store;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modem::decode::{OperatorInfo, RegistrationStatus};
pub use errors::StoreError;

pub const SIM_SCHEMA_VERSION: u8 = 1;
pub const SMS_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRecord {
    pub schema_version: u8,
    pub iccid: String,
    pub imsi: Option<String>,
    pub phone_number: Option<String>,
    pub registration_status: RegistrationStatus,
    pub signal_quality: Option<u32>,
    pub operator_info: Option<OperatorInfo>,
    /// Raw vendor network-info line.
    pub network_info: Option<String>,
    /// Raw `AT+CPIN?` payload of the last battery.
    pub cpin: Option<String>,
    pub com_port: Option<String>,
    /// Ports this SIM was bound to before, oldest first.
    pub port_history: Vec<String>,
    pub balance: Option<String>,
    pub balance_raw: Option<String>,
    pub balance_updated_at: Option<DateTime<Utc>>,
    /// Milliseconds taken by each command of the last telemetry battery.
    pub exchange_timings: BTreeMap<String, u64>,
    pub last_probed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields read by one telemetry battery. Replaces the previous telemetry wholesale,
/// except the IMSI which is only overwritten when it was read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub imsi: Option<String>,
    pub registration_status: RegistrationStatus,
    pub signal_quality: Option<u32>,
    pub operator_info: Option<OperatorInfo>,
    pub network_info: Option<String>,
    pub cpin: Option<String>,
    pub exchange_timings: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub balance: Option<String>,
    pub raw: String,
    /// Only written when the USSD answer carried a number.
    pub phone_number: Option<String>,
}

/// A partial write; `None` parts leave the stored fields untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimUpdate {
    pub telemetry: Option<TelemetrySnapshot>,
    /// Bind the SIM to this port; a different previous port moves to the history.
    pub bind_port: Option<String>,
    pub balance: Option<BalanceUpdate>,
}

impl SimRecord {
    pub fn new(iccid: &str, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SIM_SCHEMA_VERSION,
            iccid: iccid.to_string(),
            imsi: None,
            phone_number: None,
            registration_status: RegistrationStatus::Unknown,
            signal_quality: None,
            operator_info: None,
            network_info: None,
            cpin: None,
            com_port: None,
            port_history: Vec::new(),
            balance: None,
            balance_raw: None,
            balance_updated_at: None,
            exchange_timings: BTreeMap::new(),
            last_probed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, update: &SimUpdate, now: DateTime<Utc>) {
        if let Some(t) = &update.telemetry {
            if t.imsi.is_some() {
                self.imsi = t.imsi.clone();
            }
            self.registration_status = t.registration_status;
            self.signal_quality = t.signal_quality;
            self.operator_info = t.operator_info.clone();
            self.network_info = t.network_info.clone();
            self.cpin = t.cpin.clone();
            self.exchange_timings = t.exchange_timings.clone();
            self.last_probed_at = Some(now);
        }
        if let Some(port) = &update.bind_port {
            match self.com_port.take() {
                Some(old) if &old != port => self.port_history.push(old),
                _ => {}
            }
            self.com_port = Some(port.clone());
        }
        if let Some(b) = &update.balance {
            self.balance = b.balance.clone();
            self.balance_raw = Some(b.raw.clone());
            self.balance_updated_at = Some(now);
            if b.phone_number.is_some() {
                self.phone_number = b.phone_number.clone();
            }
        }
        self.updated_at = now;
    }

    /// Unbind `port` if this record still holds it. Returns whether anything changed.
    pub fn release_port(&mut self, port: &str, now: DateTime<Utc>) -> bool {
        if self.com_port.as_deref() != Some(port) {
            return false;
        }
        self.com_port = None;
        self.port_history.push(port.to_string());
        self.updated_at = now;
        true
    }

    /// Identity used to key this SIM's messages.
    pub fn sms_identity(&self) -> &str {
        self.imsi.as_deref().unwrap_or(&self.iccid)
    }
}

/// Selection over SIM records. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct SimFilter {
    pub com_port: Option<String>,
    /// Only records bound to one of these ports.
    pub port_in: Option<BTreeSet<String>>,
    /// Only records currently bound to a port.
    pub bound_only: bool,
    /// Only home or roaming records.
    pub registered_only: bool,
    /// Balance never read, or read before this instant.
    pub balance_stale_before: Option<DateTime<Utc>>,
}

impl SimFilter {
    pub fn by_port(port: &str) -> Self {
        Self {
            com_port: Some(port.to_string()),
            ..Self::default()
        }
    }

    /// Records due for a balance query at `threshold`, bound to one of `ports`.
    pub fn balance_due(threshold: DateTime<Utc>, ports: BTreeSet<String>) -> Self {
        Self {
            com_port: None,
            port_in: Some(ports),
            bound_only: true,
            registered_only: true,
            balance_stale_before: Some(threshold),
        }
    }

    pub fn matches(&self, r: &SimRecord) -> bool {
        if let Some(port) = &self.com_port {
            if r.com_port.as_ref() != Some(port) {
                return false;
            }
        }
        if let Some(ports) = &self.port_in {
            match &r.com_port {
                Some(port) if ports.contains(port) => {}
                _ => return false,
            }
        }
        if self.bound_only && r.com_port.is_none() {
            return false;
        }
        if self.registered_only && !r.registration_status.is_registered() {
            return false;
        }
        if let Some(threshold) = self.balance_stale_before {
            let stale = r.balance.is_none() || r.balance_updated_at.map_or(true, |at| at < threshold);
            if !stale {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsRecord {
    pub schema_version: u8,
    /// IMSI of the receiving SIM, or its ICCID when the IMSI is unknown.
    pub sim_identity: String,
    pub iccid: String,
    pub sender: String,
    pub time: String,
    pub content: String,
    pub status: String,
    pub modem_index: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SmsRecord {
    pub fn key(&self) -> Vec<u8> {
        sms_key(&self.sim_identity, &self.sender, &self.time)
    }
}

pub fn sms_key(identity: &str, sender: &str, time: &str) -> Vec<u8> {
    format!("sms:{}\u{0}{}\u{0}{}", identity, sender, time).into_bytes()
}

/// SIM record access. Implementations apply every write atomically per ICCID.
pub trait SimStore: Send + Sync {
    fn find_one(&self, iccid: &str) -> Result<Option<SimRecord>, StoreError>;
    /// Matching records in ICCID order.
    fn find(&self, filter: &SimFilter, skip: usize, limit: usize) -> Result<Vec<SimRecord>, StoreError>;
    fn count(&self, filter: &SimFilter) -> Result<usize, StoreError>;
    /// Create or update the record for `iccid`, returning the stored result.
    fn upsert(&self, iccid: &str, update: &SimUpdate) -> Result<SimRecord, StoreError>;
    /// Unbind `port` from `iccid` if it is still bound there.
    fn release_port(&self, iccid: &str, port: &str) -> Result<bool, StoreError>;
}

/// SMS record access, idempotent per `(identity, sender, time)`.
pub trait SmsStore: Send + Sync {
    /// Returns true when the message was not stored before.
    fn upsert_sms(&self, record: &SmsRecord) -> Result<bool, StoreError>;
    fn list_sms(&self, identity: &str) -> Result<Vec<SmsRecord>, StoreError>;
    fn count_sms(&self) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn rebinding_moves_old_port_to_history() {
        let mut r = SimRecord::new("8984", at(0));
        let bind = |p: &str| SimUpdate {
            bind_port: Some(p.into()),
            ..SimUpdate::default()
        };
        r.apply(&bind("/dev/ttyUSB0"), at(1));
        r.apply(&bind("/dev/ttyUSB0"), at(2));
        assert!(r.port_history.is_empty());
        r.apply(&bind("/dev/ttyUSB3"), at(3));
        assert_eq!(r.com_port.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(r.port_history, vec!["/dev/ttyUSB0"]);
    }

    #[test]
    fn release_only_matching_port() {
        let mut r = SimRecord::new("8984", at(0));
        r.com_port = Some("/dev/ttyUSB1".into());
        assert!(!r.release_port("/dev/ttyUSB2", at(1)));
        assert!(r.release_port("/dev/ttyUSB1", at(2)));
        assert_eq!(r.com_port, None);
        assert_eq!(r.port_history, vec!["/dev/ttyUSB1"]);
    }

    #[test]
    fn telemetry_keeps_known_imsi() {
        let mut r = SimRecord::new("8984", at(0));
        r.imsi = Some("452040000000001".into());
        let update = SimUpdate {
            telemetry: Some(TelemetrySnapshot {
                registration_status: RegistrationStatus::Home,
                signal_quality: Some(20),
                ..TelemetrySnapshot::default()
            }),
            ..SimUpdate::default()
        };
        r.apply(&update, at(5));
        assert_eq!(r.imsi.as_deref(), Some("452040000000001"));
        assert_eq!(r.sms_identity(), "452040000000001");
        assert_eq!(r.last_probed_at, Some(at(5)));
    }

    #[test]
    fn balance_due_filter() {
        let threshold = at(3600);
        let filter = SimFilter::balance_due(threshold, ["/dev/ttyUSB0".to_string()].into());
        let mut r = SimRecord::new("8984", at(0));
        r.com_port = Some("/dev/ttyUSB0".into());
        r.registration_status = RegistrationStatus::Home;
        assert!(filter.matches(&r), "never-read balance is due");
        r.balance = Some("100".into());
        r.balance_updated_at = Some(at(4000));
        assert!(!filter.matches(&r));
        r.balance_updated_at = Some(at(10));
        assert!(filter.matches(&r));
        r.registration_status = RegistrationStatus::Unknown;
        assert!(!filter.matches(&r));
        r.registration_status = RegistrationStatus::Roaming;
        assert!(filter.matches(&r));
        r.com_port = Some("/dev/ttyUSB7".into());
        assert!(!filter.matches(&r), "port no longer tracked");
        r.com_port = None;
        assert!(!filter.matches(&r));
    }
}
