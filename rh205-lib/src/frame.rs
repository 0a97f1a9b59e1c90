//! Wire framing: `[HEAD:1][CMD:1][LEN:2 BE][PAYLOAD][CHECKSUM:1]`.
//!
//! `LEN` counts the whole frame, checksum included. The checksum covers every byte
//! before it.

use crate::constants::{FRAME_HEADER_LEN, FRAME_OVERHEAD, MAX_FRAME_LEN};
use crate::error::SensorError;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Head marker, identifies who sent the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Direction {
    #[strum(to_string = "H->D")]
    HostToDevice = 0xAA,
    #[strum(to_string = "D->H")]
    DeviceToHost = 0x55,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Command {
    SamplingParams = 0x01,
    StopSampling = 0x02,
    DataDetail = 0x03,
    WaveDataResult = 0x04,
    GetSystemParams = 0x05,
    SetSystemParams = 0x06,
    SelfCheck = 0x07,
    CalibrateVibration = 0x08,
    DataList = 0x09,
    DataDetailQuery = 0x0A,
    PrepareUpgrade = 0x10,
    UpgradeData = 0x11,
    UpgradeDataResult = 0x12,
}

/// Integrity byte appended to every frame.
pub trait Checksum {
    fn compute(&self, bytes: &[u8]) -> u8;
}

/// Two's complement of the byte sum: a valid frame sums to 0 mod 256.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumComplement;

impl Checksum for SumComplement {
    fn compute(&self, bytes: &[u8]) -> u8 {
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        0u8.wrapping_sub(sum)
    }
}

/// Build a frame with the default checksum.
pub fn pack(payload: &[u8], direction: Direction, command: Command) -> Result<Bytes, SensorError> {
    pack_with(&SumComplement, payload, direction, command)
}

/// Build a frame with a caller-supplied checksum.
///
/// Fails when the frame would not fit the 16-bit length field.
pub fn pack_with<C: Checksum>(
    checksum: &C,
    payload: &[u8],
    direction: Direction,
    command: Command,
) -> Result<Bytes, SensorError> {
    let total = payload.len() + FRAME_OVERHEAD;
    let declared = u16::try_from(total).map_err(|_| {
        SensorError::InvalidParameter(format!(
            "{} byte payload does not fit one frame (limit {MAX_FRAME_LEN} bytes)",
            payload.len()
        ))
    })?;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(direction.into());
    buf.put_u8(command.into());
    buf.put_u16(declared);
    buf.put_slice(payload);
    let sum = checksum.compute(&buf);
    buf.put_u8(sum);
    Ok(buf.freeze())
}

/// Validate a frame against the expected direction, command and total length and return
/// its payload.
pub fn unpack(
    bytes: &[u8],
    direction: Direction,
    command: Command,
    expected_len: usize,
) -> Result<Bytes, SensorError> {
    unpack_with(&SumComplement, bytes, direction, command, expected_len)
}

pub fn unpack_with<C: Checksum>(
    checksum: &C,
    bytes: &[u8],
    direction: Direction,
    command: Command,
    expected_len: usize,
) -> Result<Bytes, SensorError> {
    if bytes.len() != expected_len || bytes.len() < FRAME_OVERHEAD {
        return Err(SensorError::FrameSizeMismatch {
            expected: expected_len,
            actual: bytes.len(),
        });
    }
    check_structure(checksum, bytes, direction, command)?;
    Ok(Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..bytes.len() - 1]))
}

fn check_structure<C: Checksum>(
    checksum: &C,
    bytes: &[u8],
    direction: Direction,
    command: Command,
) -> Result<(), SensorError> {
    let head: u8 = direction.into();
    if bytes[0] != head {
        return Err(SensorError::FrameHeadMismatch {
            expected: head,
            actual: bytes[0],
        });
    }
    let cmd: u8 = command.into();
    if bytes[1] != cmd {
        return Err(SensorError::FrameCommandMismatch {
            expected: cmd,
            actual: bytes[1],
        });
    }
    check_length_and_sum(checksum, bytes)
}

fn check_length_and_sum<C: Checksum>(checksum: &C, bytes: &[u8]) -> Result<(), SensorError> {
    let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if declared != bytes.len() {
        return Err(SensorError::FrameSizeMismatch {
            expected: declared,
            actual: bytes.len(),
        });
    }
    let (body, tail) = bytes.split_at(bytes.len() - 1);
    let expected = checksum.compute(body);
    if tail[0] != expected {
        return Err(SensorError::FrameChecksumMismatch {
            expected,
            actual: tail[0],
        });
    }
    Ok(())
}

/// A structurally valid inbound or outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(direction: Direction, command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            direction,
            command,
            payload: payload.into(),
        }
    }

    /// Parse any frame, checking length and checksum but not what it carries.
    pub fn parse(bytes: &[u8]) -> Result<Self, SensorError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(SensorError::FrameSizeMismatch {
                expected: FRAME_OVERHEAD,
                actual: bytes.len(),
            });
        }
        check_length_and_sum(&SumComplement, bytes)?;
        let direction = Direction::try_from(bytes[0])
            .map_err(|_| SensorError::decode(format!("unknown head {:#04x}", bytes[0]), bytes))?;
        let command = Command::try_from(bytes[1])
            .map_err(|_| SensorError::decode(format!("unknown command {:#04x}", bytes[1]), bytes))?;
        Ok(Self {
            direction,
            command,
            payload: Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..bytes.len() - 1]),
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, SensorError> {
        pack(&self.payload, self.direction, self.command)
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_complement_vectors() {
        // Frame sums to zero modulo 256
        assert_eq!(SumComplement.compute(&[]), 0x00);
        assert_eq!(SumComplement.compute(&[0x01]), 0xFF);
        assert_eq!(SumComplement.compute(&[0xAA, 0x05, 0x00, 0x05]), 0x4C);
        assert_eq!(SumComplement.compute(&[0xFF, 0xFF]), 0x02);
    }

    #[test]
    fn test_pack_empty_payload() {
        let frame = pack(&[], Direction::HostToDevice, Command::GetSystemParams).unwrap();
        assert_eq!(frame.as_ref(), &[0xAA, 0x05, 0x00, 0x05, 0x4C]);
    }

    #[test]
    fn test_length_is_big_endian() {
        let payload = vec![0u8; 300];
        let frame = pack(&payload, Direction::DeviceToHost, Command::DataDetail).unwrap();
        assert_eq!(frame.len(), 305);
        assert_eq!(&frame[2..4], &[0x01, 0x31]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let largest = vec![0u8; MAX_FRAME_LEN - FRAME_OVERHEAD];
        let frame = pack(&largest, Direction::HostToDevice, Command::UpgradeData).unwrap();
        assert_eq!(&frame[2..4], &[0xFF, 0xFF]);

        let payload = vec![0u8; MAX_FRAME_LEN - FRAME_OVERHEAD + 1];
        let err = pack(&payload, Direction::HostToDevice, Command::UpgradeData).unwrap_err();
        assert!(matches!(err, SensorError::InvalidParameter(_)), "got {err:?}");
    }

    #[test]
    fn test_parse_rejects_unknown_command() {
        let mut raw = vec![0x55, 0x7F, 0x00, 0x05];
        raw.push(SumComplement.compute(&raw));
        let err = Frame::parse(&raw).unwrap_err();
        assert!(matches!(err, SensorError::DecodeFailure { .. }), "got {err:?}");
    }
}
