//! Logging helpers for raw modem traffic.
//!
//! AT responses arrive as multi-line `\r\n` separated text. Logged verbatim they split a
//! single exchange over several log lines, so everything that echoes modem output goes
//! through [`escape_log`] first.

use std::fmt::Write;

/// Longest preview of a raw response written to the log.
const MAX_PREVIEW: usize = 240;

/// Escape a modem response for single-line logging:
/// - `\r` => `\\r`, `\n` => `\\n`, `\t` => `\\t`
/// - other control bytes (e.g. the `0x1A` SMS terminator) => `\\xNN`
///
/// Output longer than the preview cap is cut with an ellipsis.
pub fn escape_log(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in raw.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Join the lines of a response into one trimmed string (line breaks dropped).
pub fn flatten_response(raw: &str) -> String {
    raw.lines().map(str::trim_end).collect::<String>().trim().to_string()
}
