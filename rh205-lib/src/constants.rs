//! Protocol constants for the RH205 sensor node.

use std::time::Duration;

/// Head + command + 2 length bytes.
pub const FRAME_HEADER_LEN: usize = 4;
/// Header plus the trailing checksum byte.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + 1;
/// Largest frame the 16-bit length field can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Maximum payload bytes carried by one transfer chunk.
pub const CHUNK_LEN: usize = 232;
/// Maximum number of chunks in one download.
pub const MAX_CHUNK_COUNT: usize = 320;
/// Receipt bitmap size for downloads, one bit per chunk.
pub const DOWNLOAD_BITMAP_LEN: usize = MAX_CHUNK_COUNT.div_ceil(8);
/// Result bitmap size returned by the device after a firmware upload.
pub const UPLOAD_BITMAP_LEN: usize = 120;
/// Maximum number of chunks one firmware upload may be split into.
pub const MAX_UPLOAD_CHUNKS: usize = UPLOAD_BITMAP_LEN * 8;

/// Sampling rate over analysis bandwidth for the RH205.
pub const FREQ_COEFFICIENT: f32 = 2.5;
/// Points per requested length unit.
pub const POINTS_PER_LEN_UNIT: usize = 1024;
/// Analysis bandwidth per requested frequency unit, in Hz.
pub const HZ_PER_FREQ_UNIT: u32 = 100;

/// Default emissivity sent with sampling requests.
pub const DEFAULT_EMISSIVITY: f32 = 0.97;

/// Acceleration coefficients per axis, in g per ADC count.
pub const ACC_COE_Z: f64 = 0.037_422_084_375;
pub const ACC_COE_X: f64 = 0.004_790_039_062_5;
pub const ACC_COE_Y: f64 = 0.004_790_039_062_5;

/// MTU requested right after connecting.
pub const PREFERRED_MTU: u16 = 250;

/// Poll granularity of the watchdog.
pub const WATCHDOG_POLL_SLICE: Duration = Duration::from_millis(10);

/// Global ceiling on firmware retransmission rounds.
pub const MAX_UPLOAD_ROUNDS: u32 = 50;
