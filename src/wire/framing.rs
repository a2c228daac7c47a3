//! Multipart framing for the TCP byte stream.
//!
//! A wire message is a 4-byte big-endian total length followed by a body;
//! the body is a sequence of frames, each a 4-byte big-endian length plus
//! that many bytes. The envelope layer interprets the frames.

use std::fmt;

pub const MAX_MESSAGE_SIZE_BYTES: usize = 1024 * 1024;
pub const LENGTH_HEADER_SIZE_BYTES: usize = 4;

#[derive(Debug)]
pub enum FramingError {
    EmptyMessage,
    MessageTooLarge { size: usize, limit: usize },
    DeclaredLengthZero,
    DeclaredLengthTooLarge { length: usize, limit: usize },
    TruncatedFrame { declared: usize, available: usize },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "message must contain at least one frame"),
            Self::MessageTooLarge { size, limit } => {
                write!(f, "message size {size} exceeds limit {limit}")
            }
            Self::DeclaredLengthZero => write!(f, "declared message length cannot be zero"),
            Self::DeclaredLengthTooLarge { length, limit } => {
                write!(f, "declared message length {length} exceeds max {limit}")
            }
            Self::TruncatedFrame {
                declared,
                available,
            } => write!(
                f,
                "truncated frame: declared {declared} bytes, only {available} available"
            ),
        }
    }
}

impl std::error::Error for FramingError {}

pub fn pack_frames(frames: &[Vec<u8>]) -> Result<Vec<u8>, FramingError> {
    if frames.is_empty() {
        return Err(FramingError::EmptyMessage);
    }

    let body_len: usize = frames
        .iter()
        .map(|frame| LENGTH_HEADER_SIZE_BYTES + frame.len())
        .sum();
    if body_len > MAX_MESSAGE_SIZE_BYTES {
        return Err(FramingError::MessageTooLarge {
            size: body_len,
            limit: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    let mut message = Vec::with_capacity(LENGTH_HEADER_SIZE_BYTES + body_len);
    message.extend_from_slice(&(body_len as u32).to_be_bytes());
    for frame in frames {
        message.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        message.extend_from_slice(frame);
    }
    Ok(message)
}

pub fn unpack_frames(body: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
    if body.is_empty() {
        return Err(FramingError::EmptyMessage);
    }
    if body.len() > MAX_MESSAGE_SIZE_BYTES {
        return Err(FramingError::MessageTooLarge {
            size: body.len(),
            limit: MAX_MESSAGE_SIZE_BYTES,
        });
    }

    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let remaining = body.len() - offset;
        if remaining < LENGTH_HEADER_SIZE_BYTES {
            return Err(FramingError::TruncatedFrame {
                declared: LENGTH_HEADER_SIZE_BYTES,
                available: remaining,
            });
        }

        let declared = u32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]) as usize;
        offset += LENGTH_HEADER_SIZE_BYTES;

        if body.len() - offset < declared {
            return Err(FramingError::TruncatedFrame {
                declared,
                available: body.len() - offset,
            });
        }

        frames.push(body[offset..offset + declared].to_vec());
        offset += declared;
    }

    Ok(frames)
}

/// Incremental reassembly of framed messages from a non-blocking stream.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete message's frames, or `None` if more bytes
    /// are needed. Length violations poison the stream and must make the
    /// caller drop the connection.
    pub fn next_message(&mut self) -> Result<Option<Vec<Vec<u8>>>, FramingError> {
        if self.buffer.len() < LENGTH_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if declared == 0 {
            return Err(FramingError::DeclaredLengthZero);
        }
        if declared > MAX_MESSAGE_SIZE_BYTES {
            return Err(FramingError::DeclaredLengthTooLarge {
                length: declared,
                limit: MAX_MESSAGE_SIZE_BYTES,
            });
        }

        if self.buffer.len() < LENGTH_HEADER_SIZE_BYTES + declared {
            return Ok(None);
        }

        let body: Vec<u8> = self
            .buffer
            .drain(..LENGTH_HEADER_SIZE_BYTES + declared)
            .skip(LENGTH_HEADER_SIZE_BYTES)
            .collect();
        unpack_frames(&body).map(Some)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
