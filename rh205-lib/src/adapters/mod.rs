//! Typed payloads for every command, plus the traits that tie them to the frame codec.
//!
//! All multi-byte payload fields are little-endian.

pub mod records;
pub mod sampling;
pub mod self_check;
pub mod system;
pub mod transfer;

pub use records::{DataDetailQuery, DataListQuery, DataListSummary};
pub use sampling::{Axis, CalibrationParams, CalibrationResult, SampleAck, SampleParams, TemperatureReading};
pub use self_check::{ComponentStatus, SelfCheck};
pub use system::{SetSystemParamsAck, SystemParams};
pub use transfer::{CompletionReport, DataChunk, PrepareAck, PrepareUpgrade, ReceiptBitmap, UpgradeChunk, UpgradeResult};

use crate::constants::FRAME_OVERHEAD;
use crate::error::SensorError;
use crate::frame::{Command, Direction, pack, unpack};
use bytes::Bytes;
use zerocopy::FromBytes;

/// A host request.
pub trait Encode {
    fn command(&self) -> Command;

    fn encode_payload(&self) -> Result<Bytes, SensorError>;

    fn to_frame(&self) -> Result<Bytes, SensorError> {
        pack(&self.encode_payload()?, Direction::HostToDevice, self.command())
    }
}

/// A fixed-width device response.
pub trait Decode: Sized {
    const COMMAND: Command;
    const PAYLOAD_LEN: usize;

    /// Decode a bare payload; fails unless it is exactly `PAYLOAD_LEN` bytes with valid
    /// contents.
    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError>;

    /// Validate a whole device frame and decode its payload.
    fn decode(frame: &[u8]) -> Result<Self, SensorError> {
        let payload = unpack(frame, Direction::DeviceToHost, Self::COMMAND, Self::PAYLOAD_LEN + FRAME_OVERHEAD)?;
        Self::decode_payload(&payload)
    }
}

/// A request without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyRequest(pub Command);

impl Encode for EmptyRequest {
    fn command(&self) -> Command {
        self.0
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        Ok(Bytes::new())
    }
}

pub(crate) fn read_raw<T: FromBytes>(payload: &[u8], what: &str) -> Result<T, SensorError> {
    T::read_from_bytes(payload).map_err(|_| {
        SensorError::decode(
            format!("{what}: expected {} bytes, got {}", size_of::<T>(), payload.len()),
            payload,
        )
    })
}

/// Single status byte replies: 1 = accepted, 0 = refused.
pub(crate) fn read_status(payload: &[u8], what: &str) -> Result<bool, SensorError> {
    match payload {
        [1] => Ok(true),
        [0] => Ok(false),
        [other] => Err(SensorError::decode(format!("{what}: invalid status {other:#04x}"), payload)),
        _ => Err(SensorError::decode(
            format!("{what}: expected 1 byte, got {}", payload.len()),
            payload,
        )),
    }
}
