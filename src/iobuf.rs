//! Base64 I/O buffer codec and the append-only output accumulator.
//!
//! The agent transfers process I/O as base64 blobs: stdout/stderr arrive as
//! per-poll chunks in `guest-exec-status` replies, and the complete initial
//! stdin travels base64-encoded inside the `guest-exec` launch. There is no
//! chunked-stdin RPC in the protocol, so [`encode_all`] necessarily holds
//! the full encoded input in memory — a protocol limitation, not an
//! implementation shortcut.

use base64::engine::general_purpose::STANDARD as B64_STANDARD;
use base64::Engine as _;
use bytes::Bytes;

use crate::{AppError, Result};

/// Decode one base64 output chunk into raw bytes.
///
/// An empty chunk (no data this poll) decodes to empty bytes without
/// allocating or erroring.
///
/// # Errors
///
/// Returns [`AppError::Encoding`] for malformed base64; the agent never
/// emits invalid encodings, so this is treated as a protocol violation.
pub fn decode_chunk(encoded: &str) -> Result<Bytes> {
    if encoded.is_empty() {
        return Ok(Bytes::new());
    }
    let raw = B64_STANDARD
        .decode(encoded)
        .map_err(|e| AppError::Encoding(format!("invalid base64 in output chunk: {e}")))?;
    Ok(Bytes::from(raw))
}

/// Encode a complete byte buffer as one base64 string for launch stdin.
#[must_use]
pub fn encode_all(data: &[u8]) -> String {
    B64_STANDARD.encode(data)
}

/// Append-only accumulator for one output stream of a guest process.
///
/// Chunks are stored in poll-arrival order; the full output is a derived
/// view ([`OutputAccumulator::to_bytes`]), never an in-place mutation. The
/// truncation flag is sticky: once the agent reports lost bytes they are
/// unrecoverable, and later polls cannot clear the report.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    chunks: Vec<Bytes>,
    truncated: bool,
}

impl OutputAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded chunk. Empty chunks are dropped.
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    /// Record that the agent reported truncation for this stream.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    /// Whether any poll reported lost bytes.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Total accumulated length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Whether no output has been accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Concatenate all chunks, in arrival order, into one buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}
