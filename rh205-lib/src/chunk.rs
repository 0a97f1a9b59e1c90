use crate::bitmap;
use crate::constants::{CHUNK_LEN, DOWNLOAD_BITMAP_LEN, MAX_CHUNK_COUNT};
use crate::error::SensorError;
use bytes::{Bytes, BytesMut};

/// Receive-side accumulator for chunked downloads.
///
/// Slot `i` holds chunk `i` once received and bit `i` of the receipt bitmap is set exactly
/// when the slot is filled. The set is reused across transfers and must be
/// [`reset`](ChunkSet::reset) before each one.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    slots: Vec<Option<Bytes>>,
    received: [u8; DOWNLOAD_BITMAP_LEN],
}

impl Default for ChunkSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkSet {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_CHUNK_COUNT],
            received: [0; DOWNLOAD_BITMAP_LEN],
        }
    }

    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.received = [0; DOWNLOAD_BITMAP_LEN];
    }

    /// Store a chunk. A repeated index overwrites the earlier copy.
    pub fn insert(&mut self, index: usize, data: Bytes) -> Result<(), SensorError> {
        if data.len() > CHUNK_LEN {
            return Err(SensorError::decode(
                format!("chunk {index} carries {} bytes, limit is {CHUNK_LEN}", data.len()),
                &data,
            ));
        }
        let slot = self.slots.get_mut(index).ok_or(SensorError::ChunkOutOfRange {
            index,
            capacity: MAX_CHUNK_COUNT,
        })?;
        *slot = Some(data);
        bitmap::set_bit(&mut self.received, index)
    }

    pub fn contains(&self, index: usize) -> bool {
        bitmap::is_set(&self.received, index)
    }

    /// Number of filled slots.
    pub fn received_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Indices below `total` not yet received.
    pub fn missing(&self, total: usize) -> Vec<usize> {
        bitmap::missing_indices(&self.received, total.min(MAX_CHUNK_COUNT))
    }

    pub fn is_complete(&self, total: usize) -> bool {
        total <= MAX_CHUNK_COUNT && self.missing(total).is_empty()
    }

    /// Receipt bitmap restricted to `0..total`; this is the NAK (or, when complete, the ACK)
    /// sent back to the device.
    pub fn receipt_bitmap(&self, total: usize) -> Bytes {
        let mut out = [0u8; DOWNLOAD_BITMAP_LEN];
        for index in (0..total.min(MAX_CHUNK_COUNT)).filter(|&i| self.contains(i)) {
            out[index / 8] |= 1 << (index % 8);
        }
        Bytes::copy_from_slice(&out)
    }

    /// Concatenate chunks `0..total` and truncate to `expected_len` to drop the padding of
    /// the last chunk. Fewer than `expected_len` bytes is an error.
    pub fn assemble(&self, total: usize, expected_len: usize) -> Result<Bytes, SensorError> {
        let missing = self.missing(total);
        if total > MAX_CHUNK_COUNT || !missing.is_empty() {
            return Err(SensorError::TransferIncomplete {
                rounds: 0,
                missing: missing.len().max(total.saturating_sub(MAX_CHUNK_COUNT)),
            });
        }
        let mut out = BytesMut::with_capacity(total * CHUNK_LEN);
        for chunk in self.slots[..total].iter().flatten() {
            out.extend_from_slice(chunk);
        }
        if out.len() < expected_len {
            return Err(SensorError::ShortTransfer {
                expected: expected_len,
                actual: out.len(),
            });
        }
        out.truncate(expected_len);
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sets_matching_bit() {
        let mut set = ChunkSet::new();
        set.insert(3, Bytes::from_static(&[1, 2, 3])).unwrap();
        assert!(set.contains(3));
        assert!(!set.contains(2));
        assert_eq!(set.received_count(), 1);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut set = ChunkSet::new();
        let err = set.insert(MAX_CHUNK_COUNT, Bytes::from_static(&[0])).unwrap_err();
        assert!(matches!(err, SensorError::ChunkOutOfRange { index: 320, .. }));
        assert_eq!(set.received_count(), 0);
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut set = ChunkSet::new();
        let err = set.insert(0, Bytes::from(vec![0u8; CHUNK_LEN + 1])).unwrap_err();
        assert!(err.is_malformed());
        assert!(!set.contains(0));
    }

    #[test]
    fn test_assemble_truncates_padding() {
        let mut set = ChunkSet::new();
        set.insert(0, Bytes::from(vec![1u8; CHUNK_LEN])).unwrap();
        set.insert(1, Bytes::from(vec![2u8; CHUNK_LEN])).unwrap();
        let data = set.assemble(2, CHUNK_LEN + 10).unwrap();
        assert_eq!(data.len(), CHUNK_LEN + 10);
        assert_eq!(data[CHUNK_LEN], 2);
    }

    #[test]
    fn test_assemble_refuses_short_data() {
        let mut set = ChunkSet::new();
        set.insert(0, Bytes::from(vec![1u8; CHUNK_LEN])).unwrap();
        let err = set.assemble(1, 1000).unwrap_err();
        assert!(matches!(err, SensorError::ShortTransfer { expected: 1000, actual: CHUNK_LEN }));
        assert!(matches!(set.assemble(0, 1000), Err(SensorError::ShortTransfer { actual: 0, .. })));
    }

    #[test]
    fn test_reset_clears_slots_and_bitmap() {
        let mut set = ChunkSet::new();
        set.insert(0, Bytes::from_static(&[9])).unwrap();
        set.reset();
        assert_eq!(set.received_count(), 0);
        assert_eq!(set.missing(1), vec![0]);
    }
}
