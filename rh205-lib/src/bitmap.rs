//! LSB-first receipt bitmaps: bit `i` lives in byte `i / 8` at position `i % 8`.
//! A set bit means the chunk was received.

use crate::error::SensorError;

/// Set bit `index`.
pub fn set_bit(bytes: &mut [u8], index: usize) -> Result<(), SensorError> {
    let capacity = bytes.len() * 8;
    let byte = bytes
        .get_mut(index / 8)
        .ok_or(SensorError::ChunkOutOfRange { index, capacity })?;
    *byte |= 1 << (index % 8);
    Ok(())
}

/// Whether bit `index` is set. Bits past the end read as unset.
pub fn is_set(bytes: &[u8], index: usize) -> bool {
    bytes.get(index / 8).is_some_and(|b| b & (1 << (index % 8)) != 0)
}

/// Indices below `count` whose bit is unset, in ascending order.
pub fn missing_indices(bytes: &[u8], count: usize) -> Vec<usize> {
    (0..count).filter(|&i| !is_set(bytes, i)).collect()
}

/// A bitmap of `len` bytes with the given indices set.
pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Result<Vec<u8>, SensorError> {
    let mut bytes = vec![0u8; len];
    for index in indices {
        set_bit(&mut bytes, index)?;
    }
    Ok(bytes)
}
