//! Newline-delimited framing for TCP streams.
//!
//! Every message travels as UTF-8 text followed by `\n`. A `\r` right before
//! the delimiter is stripped so netcat and telnet peers interoperate. Line
//! breaks are not allowed inside a payload, so no escaping is needed.

use crate::error::{FramingError, SendError};

pub const DELIMITER: u8 = b'\n';

/// Frames longer than this are discarded up to the next delimiter.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Accumulates inbound bytes for one connection and splits them into messages.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    max_frame_len: usize,
    // Set after an oversized residual was dropped; cleared at the next delimiter.
    discarding: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
            discarding: false,
        }
    }

    /// Appends `bytes` and returns an iterator over the messages completed so far.
    ///
    /// The iterator is lazy: frames it does not reach stay buffered and are
    /// produced by the next call. Empty lines are skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(bytes);
        Frames { framer: self }
    }

    /// Bytes currently held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Produces the wire bytes for `text`.
    pub fn encode(text: &str) -> Result<Vec<u8>, SendError> {
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if text.contains(['\n', '\r']) {
            return Err(SendError::EmbeddedDelimiter);
        }
        if text.len() > MAX_FRAME_LEN {
            return Err(SendError::Oversized {
                len: text.len(),
                max: MAX_FRAME_LEN,
            });
        }

        let mut encoded = Vec::with_capacity(text.len() + 1);
        encoded.extend_from_slice(text.as_bytes());
        encoded.push(DELIMITER);
        Ok(encoded)
    }

    fn next_frame(&mut self) -> Option<Result<String, FramingError>> {
        loop {
            let Some(position) = self.buffer.iter().position(|&b| b == DELIMITER) else {
                if self.buffer.len() > self.max_frame_len {
                    self.buffer.clear();
                    self.discarding = true;
                }
                return None;
            };

            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            line.pop();

            if std::mem::take(&mut self.discarding) || line.len() > self.max_frame_len {
                return Some(Err(FramingError::Oversized {
                    max: self.max_frame_len,
                }));
            }

            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }

            return Some(
                String::from_utf8(line)
                    .map_err(|err| FramingError::InvalidUtf8 {
                        len: err.as_bytes().len(),
                    }),
            );
        }
    }
}

/// Messages completed by one [`Framer::feed`] call.
pub struct Frames<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Frames<'_> {
    type Item = Result<String, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame()
    }
}
