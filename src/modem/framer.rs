//! Accumulating framer for AT responses.
//!
//! AT replies carry no length prefix and no guaranteed terminator. The framer collects
//! raw chunks as they are read and reports completion once the accumulated complete
//! lines contain any of the caller's terminal tokens (`OK`, `ERROR`, `+CUSD:`, ...).
//! Containment is checked over the complete lines, so a token split across two reads is
//! still found and a token occurring inside message content ends the frame early.
//! A trailing line without its line break only counts once the link has gone quiet, and
//! only when that line is exactly a terminal token (see [`ResponseFramer::is_complete_when_quiet`]);
//! a half-received `+CUSD: 0,"TKC 15` keeps waiting.

/// Upper bound on one accumulated response; a full SIM's `AT+CMGL` listing fits comfortably.
const MAX_RESPONSE_SIZE: usize = 256 * 1024;

#[derive(Debug, Default)]
pub struct ResponseFramer {
    buf: Vec<u8>,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    /// Append raw bytes. Bytes past the size cap are dropped.
    pub fn push(&mut self, data: &[u8]) {
        let room = MAX_RESPONSE_SIZE.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&data[..data.len().min(room)]);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Accumulated text; invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// True once a terminal token appears within the complete lines received so far.
    pub fn is_complete(&self, terminals: &[&str]) -> bool {
        match self.buf.iter().rposition(|&b| b == b'\n') {
            Some(end) => Self::scan(&self.buf[..=end], terminals),
            None => false,
        }
    }

    /// Completion check after an empty read: the complete lines qualify as in
    /// [`is_complete`](Self::is_complete), and so does a trailing line that is nothing
    /// but a terminal token (a bare `OK` the modem never terminated).
    pub fn is_complete_when_quiet(&self, terminals: &[&str]) -> bool {
        if self.is_complete(terminals) {
            return true;
        }
        let start = self.buf.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        let tail = String::from_utf8_lossy(&self.buf[start..]);
        let tail = tail.trim();
        !tail.is_empty() && terminals.iter().any(|t| tail == *t)
    }

    fn scan(bytes: &[u8], terminals: &[&str]) -> bool {
        if terminals.is_empty() || bytes.is_empty() {
            return false;
        }
        let text = String::from_utf8_lossy(bytes);
        terminals.iter().any(|t| text.contains(t))
    }

    /// Take the accumulated response, leaving the framer empty.
    pub fn take(&mut self) -> String {
        let text = self.text();
        self.buf.clear();
        text
    }
}
