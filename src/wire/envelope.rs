//! The four-field wire envelope: `[destination, sequence, control, payload?]`.
//!
//! All fields travel as UTF-8 frames. `sequence` is a decimal-encoded
//! non-negative integer owned by the request-issuing side and echoed by the
//! replier. `payload` is present only for `job` envelopes.

use std::fmt;

use crate::wire::framing::{pack_frames, FramingError};

pub const MIN_FRAMES: usize = 3;
pub const MAX_FRAMES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Ping,
    Job,
    Pong,
    Ok,
    Shutdown,
}

impl Control {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Job => "job",
            Self::Pong => "pong",
            Self::Ok => "ok",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "ping" => Some(Self::Ping),
            "job" => Some(Self::Job),
            "pong" => Some(Self::Pong),
            "ok" => Some(Self::Ok),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    TooFewFrames { count: usize },
    TooManyFrames { count: usize },
    FrameNotUtf8 { index: usize },
    InvalidSequence { raw: String },
    UnknownControl { verb: String },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewFrames { count } => {
                write!(f, "malformed envelope: {count} frames, expected at least {MIN_FRAMES}")
            }
            Self::TooManyFrames { count } => {
                write!(f, "malformed envelope: {count} frames, expected at most {MAX_FRAMES}")
            }
            Self::FrameNotUtf8 { index } => {
                write!(f, "malformed envelope: frame #{index} is not valid UTF-8")
            }
            Self::InvalidSequence { raw } => write!(
                f,
                "malformed envelope: sequence '{raw}' is not a non-negative integer"
            ),
            Self::UnknownControl { verb } => {
                write!(f, "malformed envelope: unknown control verb '{verb}'")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub destination: String,
    pub sequence: u64,
    pub control: Control,
    pub payload: Option<String>,
}

impl Envelope {
    pub fn job(destination: impl Into<String>, sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            sequence,
            control: Control::Job,
            payload: Some(payload.into()),
        }
    }

    pub fn ping(destination: impl Into<String>, sequence: u64) -> Self {
        Self::control_only(destination, sequence, Control::Ping)
    }

    pub fn pong(destination: impl Into<String>, sequence: u64) -> Self {
        Self::control_only(destination, sequence, Control::Pong)
    }

    pub fn ok(destination: impl Into<String>, sequence: u64) -> Self {
        Self::control_only(destination, sequence, Control::Ok)
    }

    pub fn shutdown(destination: impl Into<String>, sequence: u64) -> Self {
        Self::control_only(destination, sequence, Control::Shutdown)
    }

    fn control_only(destination: impl Into<String>, sequence: u64, control: Control) -> Self {
        Self {
            destination: destination.into(),
            sequence,
            control,
            payload: None,
        }
    }

    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = vec![
            self.destination.as_bytes().to_vec(),
            self.sequence.to_string().into_bytes(),
            self.control.as_str().as_bytes().to_vec(),
        ];
        if let Some(payload) = &self.payload {
            frames.push(payload.as_bytes().to_vec());
        }
        frames
    }

    pub fn to_message(&self) -> Result<Vec<u8>, FramingError> {
        pack_frames(&self.to_frames())
    }

    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, EnvelopeError> {
        if frames.len() < MIN_FRAMES {
            return Err(EnvelopeError::TooFewFrames {
                count: frames.len(),
            });
        }
        if frames.len() > MAX_FRAMES {
            return Err(EnvelopeError::TooManyFrames {
                count: frames.len(),
            });
        }

        let destination = frame_as_str(frames, 0)?.to_owned();
        let sequence_raw = frame_as_str(frames, 1)?;
        let sequence = sequence_raw
            .parse::<u64>()
            .map_err(|_| EnvelopeError::InvalidSequence {
                raw: sequence_raw.to_owned(),
            })?;
        let verb = frame_as_str(frames, 2)?;
        let control = Control::from_verb(verb).ok_or_else(|| EnvelopeError::UnknownControl {
            verb: verb.to_owned(),
        })?;
        let payload = match frames.get(3) {
            Some(_) => Some(frame_as_str(frames, 3)?.to_owned()),
            None => None,
        };

        Ok(Self {
            destination,
            sequence,
            control,
            payload,
        })
    }
}

fn frame_as_str(frames: &[Vec<u8>], index: usize) -> Result<&str, EnvelopeError> {
    std::str::from_utf8(&frames[index]).map_err(|_| EnvelopeError::FrameNotUtf8 { index })
}
