//! Line framing for the upstream event stream.
//!
//! Chunks arrive in transport order with arbitrary boundaries. Complete lines
//! are cut on `\n` at the byte level, so a multi-byte UTF-8 sequence split
//! across two chunks stays buffered until its line is complete; only then is
//! the line decoded, lossily.

use thiserror::Error;

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("line exceeds max size: {size} > {max}")]
    OversizedLine { size: usize, max: usize },
    #[error("buffer exceeds max size without newline: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
}

#[derive(Debug, Clone, Default)]
pub struct LineReport {
    pub payloads: Vec<String>,
    pub errors: Vec<LineError>,
}

impl LineReport {
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty() && self.errors.is_empty()
    }
}

pub struct EventLineDecoder {
    max_line_bytes: usize,
    pending: Vec<u8>,
}

impl EventLineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            pending: Vec::new(),
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> LineReport {
        let mut report = LineReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            self.decode_line(&line, &mut report);
        }

        if self.pending.len() > self.max_line_bytes {
            report.errors.push(LineError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_line_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Flushes a trailing record that was not newline-terminated.
    pub fn finish(&mut self) -> LineReport {
        let mut report = LineReport::default();
        if self.pending.is_empty() {
            return report;
        }
        let line = std::mem::take(&mut self.pending);
        self.decode_line(&line, &mut report);
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut LineReport) {
        if line.len() > self.max_line_bytes {
            report.errors.push(LineError::OversizedLine {
                size: line.len(),
                max: self.max_line_bytes,
            });
            return;
        }
        let text = String::from_utf8_lossy(line);
        if let Some(payload) = payload_of_line(&text) {
            report.payloads.push(payload.to_string());
        }
    }
}

impl Default for EventLineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

/// Extracts the payload of one framed line, or `None` for lines that carry no
/// record (`event:`, `id:`, comments, blanks, the `[DONE]` sentinel).
pub fn payload_of_line(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
        rest.strip_prefix(' ').unwrap_or(rest).trim()
    } else if line.trim_start().starts_with('{') {
        line.trim()
    } else {
        return None;
    };
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }
    Some(payload)
}
