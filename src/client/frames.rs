//! Incremental decoder for push-framed responses.
//!
//! Network chunks arrive at arbitrary boundaries: inside a frame, inside the
//! JSON payload, or inside a multi-byte character. The decoder carries the
//! unfinished tail between calls and only parses complete blocks.

use devjobs_common::StreamEvent;
use thiserror::Error;

use crate::util::Utf8Decoder;

/// Largest partial frame held while waiting for its terminator.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameDecodeError {
    /// One frame was unreadable; later frames may still decode.
    #[error("Malformed frame ({reason}): {preview}")]
    Malformed { reason: String, preview: String },

    /// No frame boundary within the size limit; the stream cannot recover.
    #[error("Frame exceeded {limit} bytes without a terminator")]
    Overflow { limit: usize },
}

impl FrameDecodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }
}

pub type DecodedFrame = Result<StreamEvent, FrameDecodeError>;

#[derive(Debug)]
pub struct FrameDecoder {
    utf8: Utf8Decoder,
    carry: String,
    /// Prefix of `carry` already searched for a frame boundary.
    scanned: usize,
    /// The last chunk ended in `\r`; it may pair with a leading `\n`.
    pending_cr: bool,
    max_frame_bytes: usize,
    failed: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }

    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            utf8: Utf8Decoder::new(),
            carry: String::new(),
            scanned: 0,
            pending_cr: false,
            max_frame_bytes,
            failed: false,
        }
    }

    /// Whether an unrecoverable error has been reported.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Feed one chunk, returning every frame it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<DecodedFrame> {
        if self.failed {
            return Vec::new();
        }
        let text = self.utf8.decode(bytes);
        self.push_normalised(&text);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut from = self.scanned.saturating_sub(1);
        while let Some(end) = find_boundary(&self.carry, from) {
            if let Some(frame) = parse_block(&self.carry[start..end]) {
                frames.push(frame);
            }
            start = end + 2;
            from = start;
        }
        self.carry.drain(..start);
        self.scanned = self.carry.len();

        if self.carry.len() > self.max_frame_bytes {
            self.failed = true;
            self.carry.clear();
            self.scanned = 0;
            frames.push(Err(FrameDecodeError::Overflow {
                limit: self.max_frame_bytes,
            }));
        }
        frames
    }

    /// Append `text` to the carry with CRLF folded to LF, holding back a
    /// trailing `\r` until the next chunk shows what follows it.
    fn push_normalised(&mut self, text: &str) {
        let mut text = if self.pending_cr {
            format!("\r{text}")
        } else {
            text.to_string()
        };
        self.pending_cr = text.ends_with('\r');
        if self.pending_cr {
            text.pop();
        }
        if text.contains('\r') {
            text = text.replace("\r\n", "\n");
        }
        self.carry.push_str(&text);
    }

    /// Flush the final frame if the stream ended without its blank line.
    pub fn finish(&mut self) -> Option<DecodedFrame> {
        if self.failed {
            return None;
        }
        let rest = self.utf8.finish();
        self.push_normalised(&rest);
        if std::mem::take(&mut self.pending_cr) {
            self.carry.push('\r');
        }
        self.scanned = 0;
        let block = std::mem::take(&mut self.carry);
        let block = block.trim_end_matches(['\r', '\n']);
        if block.trim().is_empty() {
            return None;
        }
        parse_block(block)
    }
}

/// Byte index of the first `\n\n` in `carry` at or after `from`.
fn find_boundary(carry: &str, from: usize) -> Option<usize> {
    carry.as_bytes()[from..]
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| from + pos)
}

/// Parse one blank-line-delimited block. Comment-only or data-less blocks
/// (keep-alives) yield nothing.
fn parse_block(block: &str) -> Option<DecodedFrame> {
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Other fields (`event:`, `id:`, `retry:`) carry nothing we use.
    }
    if data_lines.is_empty() {
        return None;
    }

    let payload = data_lines.join("\n");
    Some(
        serde_json::from_str::<StreamEvent>(&payload).map_err(|e| FrameDecodeError::Malformed {
            reason: e.to_string(),
            preview: payload.chars().take(PREVIEW_CHARS).collect(),
        }),
    )
}
