//! Wire codec for the manager protocol.
//!
//! Frames are groups of `Key: Value` text lines terminated by one blank line:
//!
//! ```text
//! Action: Login\r\n
//! Username: admin\r\n
//! \r\n
//! ```
//!
//! Output always uses `\r\n`; input accepts bare `\n` as well. The decoder is
//! incremental: feed it transport chunks as they arrive and it returns every
//! frame completed so far, buffering the remainder. A line without a `:`
//! separator poisons only the frame it belongs to: that frame is dropped and
//! counted, and decoding resumes at the next blank line.
//!
//! Rust guideline compliant 2025-01

use crate::error::{AmiError, AmiResult};
use crate::message::AmiMessage;

/// Upper bound on a single frame's wire size. A frame that grows past this
/// without terminating indicates a corrupt or hostile peer and is fatal.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Encode one message as wire bytes: each pair on its own `Key: Value` line
/// in insertion order, with no reordering or deduplication, followed by the
/// blank-line terminator.
///
/// # Errors
///
/// Returns [`AmiError::Protocol`] if a key contains `:` or either side of a
/// pair contains a line break, since either would corrupt framing.
pub fn encode_frame(message: &AmiMessage) -> AmiResult<Vec<u8>> {
    let mut buf = Vec::new();
    for (key, value) in message.pairs() {
        if key.contains(':') || key.contains('\r') || key.contains('\n') {
            return Err(AmiError::Protocol(format!(
                "key {key:?} contains reserved characters"
            )));
        }
        if value.contains('\r') || value.contains('\n') {
            return Err(AmiError::Protocol(format!(
                "value for key {key:?} contains a line break"
            )));
        }
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and collect complete messages.
/// In banner mode the first line is consumed as the server greeting instead
/// of a frame line and surfaced via [`FrameDecoder::banner`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    current: Vec<(String, String)>,
    current_bytes: usize,
    poisoned: bool,
    want_banner: bool,
    banner: Option<String>,
    skipped: u64,
}

impl FrameDecoder {
    /// Create a decoder that expects frame lines immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder that treats the first complete line as the server
    /// banner rather than a frame line.
    pub fn expecting_banner() -> Self {
        Self {
            want_banner: true,
            ..Self::default()
        }
    }

    /// Feed bytes into the decoder and collect every frame completed so far.
    ///
    /// Incomplete data is buffered for the next call. Malformed frames (a
    /// line without `:`) are skipped and counted, not errors.
    ///
    /// # Errors
    ///
    /// Returns [`AmiError::Protocol`] if a single frame exceeds the size
    /// bound; the stream cannot be resynchronized past that point.
    pub fn feed(&mut self, bytes: &[u8]) -> AmiResult<Vec<AmiMessage>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line_end = pos;
            if line_end > 0 && self.buf[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let line = String::from_utf8_lossy(&self.buf[..line_end]).into_owned();
            self.buf.drain(..=pos);

            if self.want_banner {
                self.want_banner = false;
                self.banner = Some(line);
                continue;
            }

            if line.is_empty() {
                if self.poisoned {
                    self.poisoned = false;
                    self.skipped += 1;
                    self.current_bytes = 0;
                    log::warn!("[Codec] Skipped malformed frame ({} so far)", self.skipped);
                } else if !self.current.is_empty() {
                    self.current_bytes = 0;
                    messages.push(self.current.drain(..).collect());
                }
                // A blank line with nothing accumulated is keep-alive noise.
                continue;
            }

            self.current_bytes += line.len() + 2;
            if self.poisoned {
                continue;
            }
            match line.split_once(':') {
                Some((key, value)) => {
                    let value = value.strip_prefix(' ').unwrap_or(value);
                    self.current.push((key.to_string(), value.to_string()));
                }
                None => {
                    log::warn!("[Codec] Line without separator; dropping current frame");
                    self.poisoned = true;
                    self.current.clear();
                }
            }
        }

        if self.current_bytes + self.buf.len() > MAX_FRAME_BYTES {
            return Err(AmiError::Protocol(format!(
                "frame exceeds {MAX_FRAME_BYTES} bytes without terminating"
            )));
        }

        Ok(messages)
    }

    /// The server banner, once its line has been consumed. Only ever `Some`
    /// for decoders created with [`FrameDecoder::expecting_banner`].
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Number of malformed frames skipped since construction.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// True if the decoder is holding an incomplete line or frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || !self.current.is_empty() || self.poisoned
    }
}
