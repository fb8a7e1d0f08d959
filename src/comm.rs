/// Serial line transport: NDJSON framing shared by host and device.
///
/// The host writes one [`BeaconMessage`] per line; the device answers with
/// [`DeviceMessage`] lines. Both sides frame with [`LineReader`] and
/// (de)serialize with `serde_json_core` so the bytes on the wire are the
/// same whichever side produced them.
use crate::protocol::{
    BeaconMessage, DeviceMessage, LineBuffer, ProtocolError, MAX_LINE_LEN,
};

/// Serial baud rate
pub const SERIAL_BAUD: u32 = 115200;

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a DeviceMessage to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &DeviceMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // Append newline for NDJSON
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Encode a BeaconMessage as one newline-terminated line.
///
/// `None` if it would not fit in [`MAX_LINE_LEN`]; the device would reject
/// such a line anyway.
pub fn encode_message(msg: &BeaconMessage) -> Option<LineBuffer> {
    let mut buf = [0u8; MAX_LINE_LEN];
    let len = serde_json_core::to_slice(msg, &mut buf[..MAX_LINE_LEN - 1]).ok()?;
    buf[len] = b'\n';
    LineBuffer::from_slice(&buf[..len + 1]).ok()
}

/// Decode a BeaconMessage from one line (trailing whitespace allowed).
pub fn parse_message(data: &[u8]) -> Result<BeaconMessage, ProtocolError> {
    let trimmed = trim_whitespace(data);
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let (msg, _) = serde_json_core::from_slice::<BeaconMessage>(trimmed)
        .map_err(|_| ProtocolError::Malformed)?;
    if msg.level().is_none() {
        return Err(ProtocolError::LevelOutOfRange(msg.lvl));
    }
    Ok(msg)
}

// ── Serial NDJSON reader ───────────────────────────────────────────────

/// Serial NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
/// A line that overruns the buffer is discarded and reported as
/// [`ProtocolError::LineTooLong`] when its terminating newline arrives.
pub struct LineReader {
    buf: [u8; MAX_LINE_LEN],
    pos: usize,
    overflowed: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_LINE_LEN],
            pos: 0,
            overflowed: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<Result<&[u8], ProtocolError>> {
        if byte == b'\n' || byte == b'\r' {
            if self.overflowed {
                self.overflowed = false;
                self.pos = 0;
                Some(Err(ProtocolError::LineTooLong))
            } else if self.pos > 0 {
                let line = &self.buf[..self.pos];
                self.pos = 0;
                Some(Ok(line))
            } else {
                None
            }
        } else if self.overflowed {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            // Overflow, discard and reset
            self.pos = 0;
            self.overflowed = true;
            None
        }
    }

    /// Drop any partial line.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.overflowed = false;
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_whitespace(data: &[u8]) -> &[u8] {
    let is_ws = |b: &u8| matches!(b, b' ' | b'\n' | b'\r' | b'\t');
    let start = data.iter().position(|b| !is_ws(b)).unwrap_or(data.len());
    let end = data.iter().rposition(|b| !is_ws(b)).map_or(start, |i| i + 1);
    &data[start..end]
}
