use crate::adapters::{Decode, EmptyRequest, Encode, PrepareAck, PrepareUpgrade, UpgradeChunk, UpgradeResult};
use crate::constants::{CHUNK_LEN, MAX_UPLOAD_CHUNKS};
use crate::error::SensorError;
use crate::frame::Command;
use crate::link::Link;
use crate::session::{Inbound, OnMalformed, OpContext, SessionEvent};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A firmware image and the identifier the device files it under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub transfer_id: u32,
    pub data: Bytes,
}

impl FirmwareImage {
    pub fn new(transfer_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            transfer_id,
            data: data.into(),
        }
    }
}

/// Segmentation of an image into transfer chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UploadPlan {
    pub len: usize,
    pub chunk_count: usize,
    pub last_len: usize,
    pub crc32: u32,
}

impl UploadPlan {
    pub fn new(data: &[u8]) -> Result<Self, SensorError> {
        if data.is_empty() {
            return Err(SensorError::InvalidParameter("firmware image is empty".to_string()));
        }
        let chunk_count = data.len().div_ceil(CHUNK_LEN);
        if chunk_count > MAX_UPLOAD_CHUNKS {
            return Err(SensorError::InvalidParameter(format!(
                "firmware image needs {chunk_count} chunks, limit is {MAX_UPLOAD_CHUNKS}"
            )));
        }
        Ok(Self {
            len: data.len(),
            chunk_count,
            last_len: data.len() - (chunk_count - 1) * CHUNK_LEN,
            crc32: crc32fast::hash(data),
        })
    }

    /// Bytes of chunk `index`.
    pub fn chunk(&self, data: &Bytes, index: usize) -> Bytes {
        let start = (index * CHUNK_LEN).min(self.len);
        let end = (start + CHUNK_LEN).min(self.len);
        data.slice(start..end)
    }

    pub fn prepare(&self, transfer_id: u32) -> PrepareUpgrade {
        PrepareUpgrade {
            transfer_id,
            len: self.len as u32,
            crc32: self.crc32,
            chunk_count: self.chunk_count as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UpgradeProgress {
    /// Chunk writes so far, retransmissions included.
    pub written: usize,
    pub total: usize,
    /// Bytes per millisecond for the last chunk.
    pub throughput: f64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UpgradeReport {
    pub bytes: usize,
    pub chunks: usize,
    pub rounds: u32,
    pub retransmitted: usize,
    /// From the first chunk to the final result.
    pub elapsed: Duration,
}

struct ProgressClock {
    written: usize,
    last: Instant,
}

impl ProgressClock {
    fn tick(&mut self, len: usize, total: usize) -> UpgradeProgress {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last).as_secs_f64() * 1000.0;
        self.last = now;
        self.written += 1;
        UpgradeProgress {
            written: self.written,
            total,
            throughput: len as f64 / elapsed_ms.max(1.0),
        }
    }
}

async fn stream<L: Link>(
    ctx: &OpContext<L>,
    image: &FirmwareImage,
    plan: &UploadPlan,
    indices: impl IntoIterator<Item = usize>,
    clock: &mut ProgressClock,
) -> Result<(), SensorError> {
    for index in indices {
        if !ctx.config.chunk_interval.is_zero() {
            sleep(ctx.config.chunk_interval).await;
        }
        let chunk = UpgradeChunk {
            index: index as u32,
            data: plan.chunk(&image.data, index),
        };
        let len = chunk.data.len();
        ctx.send(chunk.to_frame()?).await?;
        ctx.emit(SessionEvent::UpgradeProgress(clock.tick(len, plan.chunk_count)));
    }
    Ok(())
}

async fn request_result<L: Link>(
    ctx: &OpContext<L>,
    inbound: &mut Inbound<L>,
    first: bool,
) -> Result<UpgradeResult, SensorError> {
    let timing = ctx.config.timing;
    let policy = if first {
        timing.upgrade_result_first
    } else {
        timing.upgrade_result
    };
    ctx.request(
        inbound,
        EmptyRequest(Command::UpgradeDataResult).to_frame()?,
        Command::UpgradeDataResult,
        policy,
        OnMalformed::Fail,
        "upgrade result was not returned",
        UpgradeResult::decode,
    )
    .await
}

/// Announce, stream and then repair an upload until the device reports every chunk.
pub(crate) async fn send<L: Link>(
    ctx: &OpContext<L>,
    image: FirmwareImage,
    plan: UploadPlan,
) -> Result<UpgradeReport, SensorError> {
    let timing = ctx.config.timing;
    let mut inbound = ctx.subscribe().await?;

    info!(
        "Upgrading: {} bytes in {} chunks, crc {:08x}",
        plan.len, plan.chunk_count, plan.crc32
    );
    ctx.request(
        &mut inbound,
        plan.prepare(image.transfer_id).to_frame()?,
        Command::PrepareUpgrade,
        timing.upgrade_prepare,
        OnMalformed::Fail,
        "upgrade was not acknowledged",
        PrepareAck::decode,
    )
    .await?;

    sleep(timing.upgrade_settle).await;
    let started = Instant::now();
    let mut clock = ProgressClock {
        written: 0,
        last: started,
    };
    stream(ctx, &image, &plan, 0..plan.chunk_count, &mut clock).await?;

    let mut rounds = 0u32;
    let mut retransmitted = 0usize;
    loop {
        let result = request_result(ctx, &mut inbound, rounds == 0).await?;
        let missing = result.missing(plan.chunk_count);
        if missing.is_empty() {
            let report = UpgradeReport {
                bytes: plan.len,
                chunks: plan.chunk_count,
                rounds,
                retransmitted,
                elapsed: started.elapsed(),
            };
            info!("Upgrade complete in {:?} after {} retransmission rounds", report.elapsed, rounds);
            return Ok(report);
        }
        if rounds >= ctx.config.max_upload_rounds {
            return Err(SensorError::TransferIncomplete {
                rounds,
                missing: missing.len(),
            });
        }
        rounds += 1;
        warn!(
            "Round {rounds}: device is missing {} of {} chunks",
            missing.len(),
            plan.chunk_count
        );
        ctx.emit(SessionEvent::RetransmitRound {
            round: rounds,
            missing: missing.clone(),
        });
        sleep(timing.upgrade_settle).await;
        retransmitted += missing.len();
        stream(ctx, &image, &plan, missing, &mut clock).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_for_thousand_bytes() {
        let data = Bytes::from(vec![0x5A; 1000]);
        let plan = UploadPlan::new(&data).unwrap();
        assert_eq!(plan.chunk_count, 5);
        assert_eq!(plan.last_len, 72);
        assert_eq!(plan.chunk(&data, 4).len(), 72);
        assert_eq!(plan.chunk(&data, 0).len(), CHUNK_LEN);
        assert_eq!(plan.crc32, crc32fast::hash(&data));
    }

    #[test]
    fn test_exact_multiple_has_full_last_chunk() {
        let plan = UploadPlan::new(&vec![1u8; CHUNK_LEN * 3]).unwrap();
        assert_eq!(plan.chunk_count, 3);
        assert_eq!(plan.last_len, CHUNK_LEN);
    }

    #[test]
    fn test_empty_and_oversized_images_rejected() {
        assert!(UploadPlan::new(&[]).is_err());
        assert!(UploadPlan::new(&vec![0u8; CHUNK_LEN * MAX_UPLOAD_CHUNKS + 1]).is_err());
        assert!(UploadPlan::new(&vec![0u8; CHUNK_LEN * MAX_UPLOAD_CHUNKS]).is_ok());
    }

    #[test]
    fn test_crc_matches_reference_value() {
        let plan = UploadPlan::new(b"123456789").unwrap();
        assert_eq!(plan.crc32, 0xCBF4_3926);
    }
}
