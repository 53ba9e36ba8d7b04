//! USSD balance query and its decoder.
//!
//! The operator answers `*101#` with free text such as
//! `+CUSD: 0,"TKC 15000 d, han 30/12/2026. So TB: +84901234567",15`. The phone number
//! and the main-account amount are picked out independently; either may be missing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::logutil::flatten_response;

/// Terminal tokens of a USSD exchange; the answer may take many seconds.
pub const TERMINALS: &[&str] = &["+CUSD:", "ERROR", "+CME ERROR"];

static PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\+84\d{9,10})").expect("valid regex"));
static BALANCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)TKC\s+(\d+)\s*(?:VND|d)").expect("valid regex"));

/// `AT+CUSD=1,"<code>",15`
pub fn balance_command(code: &str) -> String {
    format!("AT+CUSD=1,\"{}\",15", code)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub phone: Option<String>,
    pub balance: Option<String>,
}

/// True when the response carries a USSD answer at all.
pub fn is_answer(response: &str) -> bool {
    response.contains("+CUSD:")
}

/// One-line payload of a USSD answer with the `+CUSD:` prefix removed.
pub fn payload(response: &str) -> String {
    flatten_response(response).replace("+CUSD:", "").trim().to_string()
}

pub fn decode_balance(text: &str) -> BalanceInfo {
    BalanceInfo {
        phone: PHONE.captures(text).map(|c| c[1].to_string()),
        balance: BALANCE.captures(text).map(|c| c[1].to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_embeds_code() {
        assert_eq!(balance_command("*101#"), "AT+CUSD=1,\"*101#\",15");
    }

    #[test]
    fn decodes_phone_and_balance() {
        let info = decode_balance("0,\"TKC 15000 d, han 30/12/2026. TB +84901234567\",15");
        assert_eq!(info.balance.as_deref(), Some("15000"));
        assert_eq!(info.phone.as_deref(), Some("+84901234567"));
    }

    #[test]
    fn currency_suffix_is_case_insensitive() {
        assert_eq!(decode_balance("tkc 2500 vnd").balance.as_deref(), Some("2500"));
        assert_eq!(decode_balance("TKC 2500VND").balance.as_deref(), Some("2500"));
    }

    #[test]
    fn missing_tkc_leaves_balance_empty() {
        let info = decode_balance("Quy khach +849012345678 vui long thu lai");
        assert_eq!(info.balance, None);
        assert_eq!(info.phone.as_deref(), Some("+849012345678"));
        assert_eq!(decode_balance("nothing here"), BalanceInfo::default());
    }

    #[test]
    fn payload_strips_prefix_and_breaks() {
        let raw = "\r\n+CUSD: 0,\"TKC 100 d\r\nhan 01/01\",15\r\n";
        assert!(is_answer(raw));
        assert_eq!(payload(raw), "0,\"TKC 100 dhan 01/01\",15");
    }
}
