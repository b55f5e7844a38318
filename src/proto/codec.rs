//! Record codec for the guest-agent channel.
//!
//! The agent emits one JSON object per reply with no length prefix and no
//! guaranteed terminator, so [`RecordCodec`] frames the stream by scanning
//! for JSON object boundaries: brace depth tracked outside string literals,
//! with escape handling inside them. Whitespace between records (including
//! the `\n` most agent builds append) is skipped.
//!
//! Use [`RecordCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`]. A record larger than
//! [`MAX_RECORD_BYTES`] aborts decoding: once the limit is crossed the
//! stream framing cannot be trusted again.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// Maximum record length accepted by the codec: 1 MiB.
///
/// A single status reply carries at most the agent's per-process output
/// buffer in base64, which fits comfortably; anything larger means the
/// channel is not speaking the agent protocol.
pub const MAX_RECORD_BYTES: usize = 1_048_576;

/// Frames a raw byte stream into complete JSON record strings.
///
/// # Decoder
///
/// Returns `Ok(None)` while a record is still incomplete (buffering across
/// transport reads). Returns [`AppError::Protocol`] when the stream
/// contains bytes that cannot begin a record, when a record exceeds
/// [`MAX_RECORD_BYTES`], or when a record is not valid UTF-8.
#[derive(Debug, Default)]
pub struct RecordCodec {
    /// Bytes of the buffer already scanned in previous calls.
    scanned: usize,
    /// Current brace depth; zero means "between records".
    depth: usize,
    /// Whether the scanner is inside a string literal.
    in_string: bool,
    /// Whether the previous in-string byte was a backslash.
    escaped: bool,
}

impl RecordCodec {
    /// Create a codec in the between-records state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

impl Decoder for RecordCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Between records: drop inter-record whitespace and insist the next
        // byte opens an object.
        if self.depth == 0 {
            while src.first().is_some_and(u8::is_ascii_whitespace) {
                src.advance(1);
            }
            match src.first() {
                None => return Ok(None),
                Some(&b'{') => {}
                Some(&other) => {
                    return Err(AppError::Protocol(format!(
                        "unexpected byte 0x{other:02x} where a record should start"
                    )));
                }
            }
        }

        while self.scanned < src.len() {
            let byte = src[self.scanned];
            self.scanned += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let record = src.split_to(self.scanned);
                        self.reset();
                        let text = std::str::from_utf8(&record).map_err(|e| {
                            AppError::Protocol(format!("record is not valid UTF-8: {e}"))
                        })?;
                        return Ok(Some(text.to_owned()));
                    }
                }
                _ => {}
            }
        }

        if src.len() > MAX_RECORD_BYTES {
            return Err(AppError::Protocol(format!(
                "record too long: exceeded {MAX_RECORD_BYTES} bytes without closing"
            )));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.is_empty() => Ok(None),
            None => Err(AppError::Protocol(
                "channel closed mid-record".into(),
            )),
        }
    }
}
