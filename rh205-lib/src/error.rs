use crate::frame::Command;
use bytes::Bytes;
use thiserror::Error;

/// Failures reported by a [`Link`](crate::link::Link) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    Write(String),

    #[error("notification subscription failed: {0}")]
    Subscribe(String),

    #[error("notification stream closed")]
    StreamClosed,

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("connect to {device} failed: {reason}")]
    Connect { device: String, reason: String },

    #[error("MTU request failed: {0}")]
    Mtu(String),
}

/// The primary error type for the `rh205-lib` library.
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Sensor is not connected")]
    NotConnected,

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("Frame head mismatch: expected {expected:#04x}, got {actual:#04x}")]
    FrameHeadMismatch { expected: u8, actual: u8 },

    #[error("Frame command mismatch: expected {expected:#04x}, got {actual:#04x}")]
    FrameCommandMismatch { expected: u8, actual: u8 },

    #[error("Frame checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    FrameChecksumMismatch { expected: u8, actual: u8 },

    #[error("Malformed response ({reason}): {}", hex::encode(.raw))]
    DecodeFailure { reason: String, raw: Bytes },

    #[error("No response to {command}: {reason}")]
    ResponseTimeout { command: Command, reason: &'static str },

    #[error("Transfer incomplete after {rounds} retransmission rounds, {missing} chunks still missing")]
    TransferIncomplete { rounds: u32, missing: usize },

    #[error("Reassembled {actual} bytes, expected {expected}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Chunk index {index} out of range (capacity {capacity})")]
    ChunkOutOfRange { index: usize, capacity: usize },

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation superseded by a newer command")]
    Superseded,

    #[error("Analysis error: {0}")]
    Analysis(String),
}

impl SensorError {
    pub(crate) fn decode(reason: impl Into<String>, raw: &[u8]) -> Self {
        SensorError::DecodeFailure {
            reason: reason.into(),
            raw: Bytes::copy_from_slice(raw),
        }
    }

    /// Structural frame errors and payload decode errors, as opposed to link or timing failures.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            SensorError::FrameSizeMismatch { .. }
                | SensorError::FrameHeadMismatch { .. }
                | SensorError::FrameCommandMismatch { .. }
                | SensorError::FrameChecksumMismatch { .. }
                | SensorError::DecodeFailure { .. }
                | SensorError::ShortTransfer { .. }
        )
    }
}
