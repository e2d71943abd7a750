//! Incremental UTF-8 reconstruction
//!
//! Token pieces are raw bytes and a multi-byte character can be split across
//! two or more tokens. Bytes are buffered until they form valid UTF-8, and only
//! the longest valid prefix is ever emitted.

/// Byte accumulator that emits well-formed text fragments
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token piece and returns whatever text is now complete.
    ///
    /// Trailing NUL padding is stripped first. Returns an empty string when
    /// nothing is decodable yet; no byte is ever dropped.
    pub fn append(&mut self, bytes: &[u8]) -> String {
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        self.pending.extend_from_slice(&bytes[..end]);

        let valid_len = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Every longer prefix contains the broken or truncated sequence
            Err(e) => e.valid_up_to(),
        };

        if valid_len == 0 {
            return String::new();
        }

        let rest = self.pending.split_off(valid_len);
        let complete = std::mem::replace(&mut self.pending, rest);
        // valid_len was checked above
        String::from_utf8(complete).unwrap_or_default()
    }

    /// Empties the accumulator, replacing undecodable bytes with U+FFFD.
    pub fn flush(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        if let Err(e) = std::str::from_utf8(&self.pending) {
            tracing::warn!(
                "Flushing {} pending bytes with invalid UTF-8 at offset {}",
                self.pending.len(),
                e.valid_up_to()
            );
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }

    /// Discards pending bytes
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
