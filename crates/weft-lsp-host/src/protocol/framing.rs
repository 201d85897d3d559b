//! Incremental `Content-Length` frame codec.

use thiserror::Error;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Framing errors. The offending header block is discarded so decoding can
/// continue with the bytes that follow it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The header block carried no `Content-Length`.
    #[error("missing Content-Length header")]
    MissingContentLength,
    /// A header line was malformed or its length was not a number.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    /// The announced body exceeds the decoder's limit. Its bytes are skipped
    /// as they arrive.
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    Oversized {
        /// Announced `Content-Length`.
        length: usize,
        /// Largest body the decoder accepts.
        limit: usize,
    },
}

/// Prefixes `payload` with its `Content-Length` header.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reassembles frames from arbitrarily split byte chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_body: usize,
    skip: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl FrameDecoder {
    /// Creates an empty decoder without a body size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty decoder rejecting bodies longer than `max_body`.
    #[must_use]
    pub fn with_limit(max_body: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_body,
            skip: 0,
        }
    }

    /// Appends a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        let skipped = self.skip.min(chunk.len());
        self.skip -= skipped;
        self.buffer.extend_from_slice(&chunk[skipped..]);
    }

    /// Number of bytes waiting for the rest of their frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete payload, or `None` until more bytes arrive.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] when the next header block is unusable.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(header_end) = self
            .buffer
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
        else {
            return Ok(None);
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        let length = match parse_content_length(&self.buffer[..header_end]) {
            Ok(length) => length,
            Err(error) => {
                self.buffer.drain(..body_start);
                return Err(error);
            }
        };

        let body_end = match body_start.checked_add(length) {
            Some(end) if length <= self.max_body => end,
            _ => {
                self.buffer.drain(..body_start);
                let skipped = length.min(self.buffer.len());
                self.buffer.drain(..skipped);
                self.skip = length - skipped;
                return Err(FrameError::Oversized {
                    length,
                    limit: self.max_body,
                });
            }
        };
        if self.buffer.len() < body_end {
            return Ok(None);
        }

        let payload = self.buffer[body_start..body_end].to_vec();
        self.buffer.drain(..body_end);
        Ok(Some(payload))
    }
}

fn parse_content_length(headers: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| FrameError::InvalidHeader(String::from("header block is not UTF-8")))?;

    let mut content_length = None;
    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::InvalidHeader(line.to_owned()))?;
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let parsed = value
                .trim()
                .parse()
                .map_err(|_| FrameError::InvalidHeader(line.to_owned()))?;
            content_length = Some(parsed);
        }
    }

    content_length.ok_or(FrameError::MissingContentLength)
}
