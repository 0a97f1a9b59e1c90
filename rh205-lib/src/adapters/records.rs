//! Queries over captures stored on the node.

use super::{Decode, Encode, read_raw};
use crate::error::SensorError;
use crate::frame::Command;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DataListQueryRaw {
    pub from: U32,
    pub to: U32,
}

fn unix_seconds(at: DateTime<Utc>) -> Result<U32, SensorError> {
    u32::try_from(at.timestamp())
        .map(U32::new)
        .map_err(|_| SensorError::InvalidParameter(format!("{at} is outside the device clock range")))
}

fn from_unix_seconds(seconds: u32) -> Option<DateTime<Utc>> {
    match seconds {
        0 => None,
        s => DateTime::from_timestamp(s as i64, 0),
    }
}

/// Ask how many captures were stored in `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataListQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DataListQuery {
    pub fn from_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: DataListQueryRaw = read_raw(payload, "data list query")?;
        let at = |s: u32| DateTime::from_timestamp(s as i64, 0).unwrap_or_default();
        Ok(Self {
            from: at(raw.from.get()),
            to: at(raw.to.get()),
        })
    }
}

impl Encode for DataListQuery {
    fn command(&self) -> Command {
        Command::DataList
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        if self.to < self.from {
            return Err(SensorError::InvalidParameter("query range ends before it starts".to_string()));
        }
        let raw = DataListQueryRaw {
            from: unix_seconds(self.from)?,
            to: unix_seconds(self.to)?,
        };
        Ok(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DataListSummaryRaw {
    pub count: U32,
    pub oldest: U32,
    pub newest: U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DataListSummary {
    pub count: u32,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl Decode for DataListSummary {
    const COMMAND: Command = Command::DataList;
    const PAYLOAD_LEN: usize = size_of::<DataListSummaryRaw>();

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: DataListSummaryRaw = read_raw(payload, "data list")?;
        let summary = Self {
            count: raw.count.get(),
            oldest: from_unix_seconds(raw.oldest.get()),
            newest: from_unix_seconds(raw.newest.get()),
        };
        if summary.oldest > summary.newest {
            return Err(SensorError::decode("oldest record is newer than the newest", payload));
        }
        Ok(summary)
    }
}

impl DataListSummary {
    pub fn to_payload(&self) -> Bytes {
        let secs = |at: Option<DateTime<Utc>>| U32::new(at.map_or(0, |t| t.timestamp() as u32));
        let raw = DataListSummaryRaw {
            count: U32::new(self.count),
            oldest: secs(self.oldest),
            newest: secs(self.newest),
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DataDetailQueryRaw {
    pub record: U32,
    pub data_len: U32,
}

/// Fetch one stored capture of `data_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DataDetailQuery {
    pub record: u32,
    pub data_len: u32,
}

impl DataDetailQuery {
    pub fn from_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: DataDetailQueryRaw = read_raw(payload, "data detail query")?;
        Ok(Self {
            record: raw.record.get(),
            data_len: raw.data_len.get(),
        })
    }
}

impl Encode for DataDetailQuery {
    fn command(&self) -> Command {
        Command::DataDetailQuery
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        let raw = DataDetailQueryRaw {
            record: U32::new(self.record),
            data_len: U32::new(self.data_len),
        };
        Ok(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_has_no_dates() {
        let summary = DataListSummary::decode_payload(&[0u8; 12]).unwrap();
        assert_eq!(summary.count, 0);
        assert!(summary.oldest.is_none() && summary.newest.is_none());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let now = Utc::now();
        let query = DataListQuery {
            from: now,
            to: now - chrono::Duration::hours(1),
        };
        assert!(query.encode_payload().is_err());
    }

    #[test]
    fn test_summary_dates_decode() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        payload.extend_from_slice(&1_700_086_400u32.to_le_bytes());
        let summary = DataListSummary::decode_payload(&payload).unwrap();
        assert_eq!(summary.count, 3);
        let span = summary.newest.unwrap() - summary.oldest.unwrap();
        assert_eq!(span.num_days(), 1);
        assert_eq!(summary.to_payload().as_ref(), payload.as_slice());
    }
}
