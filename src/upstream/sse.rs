//! Line-buffered decoding of upstream Server-Sent Events.
//!
//! [`SseDecoder`] reassembles SSE lines across TCP chunk boundaries and
//! yields the payload of every `data:` line. Other SSE fields (`event:`,
//! `id:`, `retry:`, comments) are skipped.

/// Longest line accepted before the stream is declared malformed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A single SSE line grew past [`MAX_LINE_BYTES`] without a newline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("SSE line exceeded {0} bytes without a line break")]
pub struct LineTooLong(pub usize);

/// Incremental SSE `data:` extractor.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning every `data:` payload it completes.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, LineTooLong> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = Self::data_of(&line[..line.len() - 1]) {
                payloads.push(data);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            let len = self.buffer.len();
            self.buffer.clear();
            return Err(LineTooLong(len));
        }

        Ok(payloads)
    }

    /// Flush a trailing line that arrived without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::data_of(&line)
    }

    /// Extract the payload of a single SSE line, if it is a non-empty `data:` line.
    fn data_of(line: &[u8]) -> Option<String> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line);
        let data = text.strip_prefix("data:")?;
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data.is_empty() {
            None
        } else {
            Some(data.to_string())
        }
    }
}
