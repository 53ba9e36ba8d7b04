//! Text-mode SMS listing (`AT+CMGL="ALL"`) and sender decoding.
//!
//! A listing is a run of blocks
//!
//! ```text
//! +CMGL: 3,"REC READ","+84901234567",,"26/10/16,09:12:44+28"
//! first line of the body
//! second line
//! +CMGL: 4,...
//! ...
//!
//! OK
//! ```
//!
//! A body extends to the next `+CMGL:` header or to the blank line before the final
//! `OK`. A block that is never terminated (truncated listing) is dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\+CMGL: (\d+),"([^"]*)","([^"]*)",(?:"[^"]*")?,"([^"]*)"[^\r\n]*\r?\n"#)
        .expect("valid regex")
});
static BODY_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n(?:\+CMGL:|\r?\nOK)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsEntry {
    /// Storage index on the SIM; not stable across sessions.
    pub index: String,
    pub status: String,
    pub sender: String,
    pub time: String,
    pub content: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("sender {input:?} has no valid character group at offset {position}")]
    InvalidEncoding { input: String, position: usize },
}

/// Parse a `+CMGL` listing into its messages, in listing order.
pub fn parse_listing(data: &str) -> Vec<SmsEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while let Some(caps) = HEADER.captures_at(data, pos) {
        let Some(header) = caps.get(0) else { break };
        let body_start = header.end();
        match BODY_END.find_at(data, body_start) {
            Some(end) => {
                entries.push(SmsEntry {
                    index: caps[1].to_string(),
                    status: caps[2].to_string(),
                    sender: caps[3].to_string(),
                    time: caps[4].to_string(),
                    content: data[body_start..end.start()].trim().to_string(),
                });
                pos = end.start();
            }
            None => pos = body_start,
        }
    }
    entries
}

/// Decode a digit-encoded alphanumeric sender.
///
/// Reads left to right, preferring a two-digit group in `32..=99` and falling back to a
/// three-digit group in `100..=126`; each group is one ASCII character. A position where
/// neither fits fails the whole decode.
pub fn decode_sender(digits: &str) -> Result<String, DecodeError> {
    let bytes = digits.as_bytes();
    let invalid = |position| DecodeError::InvalidEncoding {
        input: digits.to_string(),
        position,
    };
    let group = |at: usize, len: usize| -> Option<u32> {
        let slice = bytes.get(at..at + len)?;
        if !slice.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(slice).ok()?.parse().ok()
    };

    let mut out = String::with_capacity(bytes.len() / 2);
    let mut i = 0;
    while i < bytes.len() {
        let (code, len) = match group(i, 2) {
            Some(v) if (32..=99).contains(&v) => (v, 2),
            _ => match group(i, 3) {
                Some(v) if (100..=126).contains(&v) => (v, 3),
                _ => return Err(invalid(i)),
            },
        };
        out.push(char::from_u32(code).ok_or_else(|| invalid(i))?);
        i += len;
    }
    Ok(out)
}

/// Sender as it should be stored: all-digit senders are decoded, anything else
/// (international numbers, plain names) is kept verbatim.
pub fn resolve_sender(raw: &str) -> Result<String, DecodeError> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        decode_sender(raw)
    } else {
        Ok(raw.to_string())
    }
}
