//! Payloads of the chunked transfer protocol.

use super::{Decode, Encode, read_raw, read_status};
use crate::constants::{CHUNK_LEN, DOWNLOAD_BITMAP_LEN, UPLOAD_BITMAP_LEN};
use crate::error::SensorError;
use crate::frame::Command;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// One downloaded chunk: `[index:u16][bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub index: u16,
    pub data: Bytes,
}

impl DataChunk {
    pub const HEADER_LEN: usize = 2;

    pub fn from_payload(payload: &Bytes) -> Result<Self, SensorError> {
        if payload.len() < Self::HEADER_LEN {
            return Err(SensorError::decode("data chunk shorter than its index", payload));
        }
        if payload.len() > Self::HEADER_LEN + CHUNK_LEN {
            return Err(SensorError::decode(
                format!("data chunk carries {} bytes", payload.len() - Self::HEADER_LEN),
                payload,
            ));
        }
        let mut buf = payload.clone();
        let index = buf.get_u16_le();
        Ok(Self { index, data: buf })
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.data.len());
        buf.put_u16_le(self.index);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// End-of-stream marker naming how many chunks the device sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReport {
    pub total: u32,
}

impl Decode for CompletionReport {
    const COMMAND: Command = Command::WaveDataResult;
    const PAYLOAD_LEN: usize = 4;

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: U32 = read_raw(payload, "transfer completion")?;
        Ok(Self { total: raw.get() })
    }
}

impl CompletionReport {
    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.total.to_le_bytes())
    }
}

/// Host reply to a completion report: bit set = chunk received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptBitmap(pub Bytes);

impl ReceiptBitmap {
    pub fn from_payload(payload: &[u8]) -> Result<Self, SensorError> {
        if payload.len() != DOWNLOAD_BITMAP_LEN {
            return Err(SensorError::decode(
                format!("receipt bitmap: expected {DOWNLOAD_BITMAP_LEN} bytes, got {}", payload.len()),
                payload,
            ));
        }
        Ok(Self(Bytes::copy_from_slice(payload)))
    }
}

impl Encode for ReceiptBitmap {
    fn command(&self) -> Command {
        Command::WaveDataResult
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PrepareUpgradeRaw {
    pub transfer_id: U32,
    pub len: U32,
    pub crc32: U32,
    pub chunk_count: U32,
}

/// Announces a firmware image before streaming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareUpgrade {
    pub transfer_id: u32,
    pub len: u32,
    pub crc32: u32,
    pub chunk_count: u32,
}

impl PrepareUpgrade {
    pub fn from_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: PrepareUpgradeRaw = read_raw(payload, "upgrade preparation")?;
        Ok(Self {
            transfer_id: raw.transfer_id.get(),
            len: raw.len.get(),
            crc32: raw.crc32.get(),
            chunk_count: raw.chunk_count.get(),
        })
    }
}

impl Encode for PrepareUpgrade {
    fn command(&self) -> Command {
        Command::PrepareUpgrade
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        let raw = PrepareUpgradeRaw {
            transfer_id: U32::new(self.transfer_id),
            len: U32::new(self.len),
            crc32: U32::new(self.crc32),
            chunk_count: U32::new(self.chunk_count),
        };
        Ok(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareAck;

impl Decode for PrepareAck {
    const COMMAND: Command = Command::PrepareUpgrade;
    const PAYLOAD_LEN: usize = 1;

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        if !read_status(payload, "upgrade preparation")? {
            return Err(SensorError::decode("device refused the firmware upgrade", payload));
        }
        Ok(Self)
    }
}

/// One firmware chunk: `[index:u32][bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeChunk {
    pub index: u32,
    pub data: Bytes,
}

impl UpgradeChunk {
    pub const HEADER_LEN: usize = 4;

    pub fn from_payload(payload: &Bytes) -> Result<Self, SensorError> {
        if payload.len() < Self::HEADER_LEN || payload.len() > Self::HEADER_LEN + CHUNK_LEN {
            return Err(SensorError::decode("firmware chunk has an invalid size", payload));
        }
        let mut buf = payload.clone();
        let index = buf.get_u32_le();
        Ok(Self { index, data: buf })
    }
}

impl Encode for UpgradeChunk {
    fn command(&self) -> Command {
        Command::UpgradeData
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.data.len());
        buf.put_u32_le(self.index);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }
}

/// Which firmware chunks the device holds: bit set = received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResult {
    pub received: [u8; UPLOAD_BITMAP_LEN],
}

impl Decode for UpgradeResult {
    const COMMAND: Command = Command::UpgradeDataResult;
    const PAYLOAD_LEN: usize = UPLOAD_BITMAP_LEN;

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let received: [u8; UPLOAD_BITMAP_LEN] = read_raw(payload, "upgrade result")?;
        Ok(Self { received })
    }
}

impl UpgradeResult {
    /// Chunks below `count` the device still needs.
    pub fn missing(&self, count: usize) -> Vec<usize> {
        crate::bitmap::missing_indices(&self.received, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_chunk_index_is_little_endian() {
        let chunk = DataChunk::from_payload(&Bytes::from_static(&[0x09, 0x01, 0xAB, 0xCD])).unwrap();
        assert_eq!(chunk.index, 0x0109);
        assert_eq!(chunk.data.as_ref(), &[0xAB, 0xCD]);
    }

    #[test]
    fn test_data_chunk_too_long_rejected() {
        let payload = Bytes::from(vec![0u8; DataChunk::HEADER_LEN + CHUNK_LEN + 1]);
        assert!(DataChunk::from_payload(&payload).is_err());
    }

    #[test]
    fn test_prepare_layout() {
        let prepare = PrepareUpgrade {
            transfer_id: 1,
            len: 1000,
            crc32: 0xDEADBEEF,
            chunk_count: 5,
        };
        let payload = prepare.encode_payload().unwrap();
        assert_eq!(hex::encode(&payload), "01000000e8030000efbeadde05000000");
        assert_eq!(PrepareUpgrade::from_payload(&payload).unwrap(), prepare);
    }
}
