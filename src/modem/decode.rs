//! Decoders for the telemetry battery.
//!
//! Each decoder takes the raw response of one exchange (absent on timeout) and never
//! fails: malformed input decodes to a sentinel (`Unknown`, `None`) so the battery can
//! continue with the next command.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::link::OpenError;
use super::ChannelError;
use crate::logutil::flatten_response;

static FIRST_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Home,
    Roaming,
    #[default]
    Unknown,
}

impl RegistrationStatus {
    /// Home or roaming: the SIM can reach the network.
    pub fn is_registered(self) -> bool {
        matches!(self, RegistrationStatus::Home | RegistrationStatus::Roaming)
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RegistrationStatus::Home => "home",
            RegistrationStatus::Roaming => "roaming",
            RegistrationStatus::Unknown => "unknown",
        })
    }
}

/// `+CREG: 0,5` is roaming, `+CREG: 0,1` is home.
pub fn registration(response: Option<&str>) -> RegistrationStatus {
    match response {
        Some(r) if r.contains("0,5") => RegistrationStatus::Roaming,
        Some(r) if r.contains("0,1") => RegistrationStatus::Home,
        _ => RegistrationStatus::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimReadiness {
    Ready,
    Unknown,
    AccessDenied,
    FileNotFound,
}

impl SimReadiness {
    pub fn is_ready(self) -> bool {
        self == SimReadiness::Ready
    }

    /// Readiness of a port that could not even be opened.
    pub fn from_open_error(err: &ChannelError) -> Self {
        match err.open_error() {
            None | Some(OpenError::NotFound(_)) => SimReadiness::FileNotFound,
            Some(OpenError::PermissionDenied(_)) => SimReadiness::AccessDenied,
            Some(_) => SimReadiness::Unknown,
        }
    }
}

impl std::fmt::Display for SimReadiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SimReadiness::Ready => "ready",
            SimReadiness::Unknown => "unknown",
            SimReadiness::AccessDenied => "access_denied",
            SimReadiness::FileNotFound => "file_not_found",
        })
    }
}

pub fn sim_readiness(response: Option<&str>) -> SimReadiness {
    match response {
        Some(r) if r.contains("READY") => SimReadiness::Ready,
        _ => SimReadiness::Unknown,
    }
}

/// First integer of the response (`+CSQ: 21,0` gives 21).
pub fn signal_quality(response: Option<&str>) -> Option<u32> {
    let r = response?;
    FIRST_INT.find(r).and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorInfo {
    pub mode: String,
    pub format: String,
    pub operator: String,
    /// Trailing fields such as the access technology.
    pub other: Vec<String>,
}

/// `+COPS: 0,0,"Viettel",7` into its fields. Fewer than three fields is no operator.
pub fn operator(response: Option<&str>) -> Option<OperatorInfo> {
    let cleaned = flatten_response(response?)
        .replace("+COPS:", "")
        .replace("OK", "")
        .replace('"', "");
    let mut fields = cleaned.split(',').map(|f| f.trim().to_string());
    let mode = fields.next().filter(|f| !f.is_empty())?;
    let format = fields.next()?;
    let operator = fields.next()?;
    Some(OperatorInfo {
        mode,
        format,
        operator,
        other: fields.collect(),
    })
}

/// `+CCID: 8984...` into the digit string.
pub fn iccid(response: Option<&str>) -> Option<String> {
    let cleaned = flatten_response(response?)
        .replace("+CCID:", "")
        .replace("OK", "");
    let value = cleaned.trim();
    if value.is_empty() || value.contains("ERROR") {
        None
    } else {
        Some(value.to_string())
    }
}

/// The IMSI is the only digit run in an `AT+CIMI` answer.
pub fn imsi(response: Option<&str>) -> Option<String> {
    let r = response?;
    if r.contains("ERROR") {
        return None;
    }
    FIRST_INT
        .find_iter(r)
        .map(|m| m.as_str())
        .find(|d| d.len() >= 6)
        .map(str::to_string)
}

/// Vendor network-info line (`+QNWINFO: "FDD LTE","45204","LTE BAND 3",1650`), kept raw.
pub fn network_info(response: Option<&str>) -> Option<String> {
    let flat = flatten_response(response?);
    let payload = flat.trim_end_matches("OK").trim();
    if payload.is_empty() || payload.contains("ERROR") {
        None
    } else {
        Some(payload.to_string())
    }
}

/// CPIN payload without the trailing `OK`, for the record.
pub fn cpin_payload(response: Option<&str>) -> Option<String> {
    network_info(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_variants() {
        assert_eq!(registration(Some("+CREG: 0,1\r\n\r\nOK\r\n")), RegistrationStatus::Home);
        assert_eq!(registration(Some("+CREG: 0,5\r\n\r\nOK\r\n")), RegistrationStatus::Roaming);
        assert_eq!(registration(Some("+CREG: 0,2\r\n\r\nOK\r\n")), RegistrationStatus::Unknown);
        assert_eq!(registration(None), RegistrationStatus::Unknown);
    }

    #[test]
    fn readiness_and_open_errors() {
        assert!(sim_readiness(Some("+CPIN: READY\r\nOK\r\n")).is_ready());
        assert_eq!(sim_readiness(Some("+CME ERROR: 10\r\n")), SimReadiness::Unknown);
        let denied = ChannelError::ConnectFailed {
            port: "p".into(),
            attempts: 3,
            last: OpenError::PermissionDenied("p".into()),
        };
        assert_eq!(SimReadiness::from_open_error(&denied), SimReadiness::AccessDenied);
        assert_eq!(
            SimReadiness::from_open_error(&ChannelError::NotFound("p".into())),
            SimReadiness::FileNotFound
        );
        assert_eq!(SimReadiness::AccessDenied.to_string(), "access_denied");
    }

    #[test]
    fn signal_quality_takes_first_integer() {
        assert_eq!(signal_quality(Some("+CSQ: 21,99\r\n\r\nOK\r\n")), Some(21));
        assert_eq!(signal_quality(Some("ERROR")), None);
        assert_eq!(signal_quality(None), None);
    }

    #[test]
    fn operator_tuple() {
        let op = operator(Some("+COPS: 0,0,\"Viettel\",7\r\n\r\nOK\r\n")).unwrap();
        assert_eq!(op.mode, "0");
        assert_eq!(op.format, "0");
        assert_eq!(op.operator, "Viettel");
        assert_eq!(op.other, vec!["7"]);
        assert_eq!(operator(Some("+COPS: 0\r\n\r\nOK\r\n")), None);
        assert_eq!(operator(None), None);
    }

    #[test]
    fn iccid_and_imsi() {
        assert_eq!(
            iccid(Some("+CCID: 89840480001234567890\r\n\r\nOK\r\n")).as_deref(),
            Some("89840480001234567890")
        );
        assert_eq!(iccid(Some("\r\nOK\r\n")), None);
        assert_eq!(iccid(Some("+CME ERROR: 10")), None);
        assert_eq!(imsi(Some("\r\n452040123456789\r\n\r\nOK\r\n")).as_deref(), Some("452040123456789"));
        assert_eq!(imsi(Some("+CME ERROR: 10\r\n")), None);
    }

    #[test]
    fn network_info_is_kept_raw() {
        let raw = "+QNWINFO: \"FDD LTE\",\"45204\",\"LTE BAND 3\",1650\r\n\r\nOK\r\n";
        assert_eq!(
            network_info(Some(raw)).as_deref(),
            Some("+QNWINFO: \"FDD LTE\",\"45204\",\"LTE BAND 3\",1650")
        );
        assert_eq!(network_info(Some("ERROR\r\n")), None);
    }
}
