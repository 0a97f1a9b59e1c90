use crate::adapters::{
    CompletionReport, DataChunk, DataDetailQuery, Decode, Encode, ReceiptBitmap, SampleAck, SampleParams,
};
use crate::chunk::ChunkSet;
use crate::constants::{CHUNK_LEN, MAX_CHUNK_COUNT};
use crate::error::SensorError;
use crate::frame::{Command, Direction, Frame};
use crate::link::Link;
use crate::session::{OpContext, SessionEvent};
use crate::watchdog::{Exchange, RetryPolicy, WatchdogHandle};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Sizes and time budgets of one download, derived from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransferPlan {
    /// Bytes expected after reassembly.
    pub data_len: usize,
    pub expected_chunks: usize,
    /// Time the device spends sampling before it starts sending.
    pub collect: Duration,
    /// Budget for moving the data over the air.
    pub transfer: Duration,
}

impl TransferPlan {
    fn new(data_len: usize, collect: Duration, transfer: Duration) -> Result<Self, SensorError> {
        let expected_chunks = data_len.div_ceil(CHUNK_LEN);
        if expected_chunks > MAX_CHUNK_COUNT {
            return Err(SensorError::InvalidParameter(format!(
                "{data_len} bytes need {expected_chunks} chunks, limit is {MAX_CHUNK_COUNT}"
            )));
        }
        Ok(Self {
            data_len,
            expected_chunks,
            collect,
            transfer,
        })
    }

    /// Live capture: two bytes per point, sampled at the analysis rate times `freq_coefficient`.
    pub fn for_capture(params: &SampleParams, freq_coefficient: f32) -> Result<Self, SensorError> {
        let points = params.points();
        let sampling_hz = params.analysis_hz() as f64 * freq_coefficient as f64;
        if sampling_hz <= 0.0 {
            return Err(SensorError::InvalidParameter("sampling rate must be positive".to_string()));
        }
        let collect = Duration::from_secs_f64(points as f64 / sampling_hz);
        let transfer = Duration::from_millis((points * 2 / 4 + points * 10) as u64);
        Self::new(points * 2, collect, transfer)
    }

    /// Stored record: nothing to sample, half a millisecond per byte to transfer.
    pub fn for_record(query: &DataDetailQuery) -> Result<Self, SensorError> {
        if query.data_len == 0 {
            return Err(SensorError::InvalidParameter("record length must be non-zero".to_string()));
        }
        let data_len = query.data_len as usize;
        Self::new(data_len, Duration::ZERO, Duration::from_millis(data_len as u64 / 2))
    }
}

/// A reassembled capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Raw little-endian 16-bit samples.
    pub data: Bytes,
    pub chunks: usize,
    /// First chunk to completion.
    pub elapsed: Duration,
}

impl Waveform {
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Bytes per millisecond.
    pub fn throughput(&self) -> f64 {
        self.data.len() as f64 / (self.elapsed.as_secs_f64() * 1000.0).max(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DownloadStart {
    /// Capture parameters, acknowledged by the device before sampling.
    Capture,
    /// Stored-record query, answered directly by the chunk stream.
    Record,
}

impl DownloadStart {
    fn command(self) -> Command {
        match self {
            DownloadStart::Capture => Command::SamplingParams,
            DownloadStart::Record => Command::DataDetailQuery,
        }
    }
}

/// Run one download: send `request`, collect chunks, NAK gaps until the device has
/// delivered `0..total`, then acknowledge.
pub(crate) async fn receive<L: Link>(
    ctx: &OpContext<L>,
    chunks: &mut ChunkSet,
    request: Bytes,
    plan: TransferPlan,
    start: DownloadStart,
) -> Result<Waveform, SensorError> {
    let command = start.command();
    let timing = ctx.config.timing;
    let mut inbound = ctx.subscribe().await?;
    chunks.reset();

    let accepted = Exchange::new();
    let first_chunk = Exchange::new();
    let completion = Exchange::new();
    let nak = Exchange::new();

    let first_chunk_policy = RetryPolicy::new(Duration::ZERO, plan.collect, 0, timing.first_chunk_grace);
    let completion_policy = RetryPolicy::new(Duration::ZERO, plan.collect + plan.transfer, 0, timing.completion_grace);

    let mut start_dog = match start {
        DownloadStart::Capture => ctx.arm(timing.sampling, &accepted, request),
        DownloadStart::Record => ctx.arm(timing.record_request, &first_chunk, request),
    };
    let mut first_chunk_dog = WatchdogHandle::disarmed();
    let mut completion_dog = WatchdogHandle::disarmed();
    let mut nak_dog = WatchdogHandle::disarmed();
    let mut streaming = false;
    let mut started: Option<Instant> = None;

    info!(
        "Expecting {} bytes in {} chunks (collect {:?}, transfer {:?})",
        plan.data_len, plan.expected_chunks, plan.collect, plan.transfer
    );

    loop {
        tokio::select! {
            raw = inbound.recv() => {
                let raw = raw?;
                let frame = match Frame::parse(&raw) {
                    Ok(frame) if frame.direction == Direction::DeviceToHost => frame,
                    Ok(frame) => {
                        ctx.malformed(command, &SensorError::FrameHeadMismatch {
                            expected: Direction::DeviceToHost.into(),
                            actual: frame.direction.into(),
                        });
                        continue;
                    }
                    Err(err) => {
                        ctx.malformed(command, &err);
                        continue;
                    }
                };

                match frame.command {
                    Command::SamplingParams if start == DownloadStart::Capture => {
                        let ack = SampleAck::decode_payload(&frame.payload)?;
                        if !accepted.succeed() {
                            continue;
                        }
                        start_dog.cancel();
                        info!("Sampling started");
                        ctx.emit(SessionEvent::SampleAccepted(ack));
                        // Chunks can overtake the acknowledgement
                        if chunks.received_count() == 0 {
                            first_chunk_dog = ctx.arm_idle(first_chunk_policy, &first_chunk);
                        }
                        if completion.is_pending() {
                            completion_dog = ctx.arm_idle(completion_policy, &completion);
                        }
                    }
                    Command::DataDetail => {
                        let chunk = match DataChunk::from_payload(&frame.payload) {
                            Ok(chunk) => chunk,
                            Err(err) => {
                                ctx.malformed(command, &err);
                                continue;
                            }
                        };
                        let index = chunk.index as usize;
                        if let Err(err) = chunks.insert(index, chunk.data) {
                            ctx.malformed(command, &err);
                            continue;
                        }
                        debug!("Chunk {index} stored");
                        started.get_or_insert_with(Instant::now);
                        first_chunk.succeed();
                        if start == DownloadStart::Record && !streaming {
                            streaming = true;
                            let policy = RetryPolicy::new(Duration::ZERO, plan.transfer, 0, timing.completion_grace);
                            completion_dog = ctx.arm_idle(policy, &completion);
                        }
                    }
                    Command::WaveDataResult => {
                        let report = match CompletionReport::decode_payload(&frame.payload) {
                            Ok(report) => report,
                            Err(err) => {
                                ctx.malformed(command, &err);
                                continue;
                            }
                        };
                        let total = report.total as usize;
                        if total > MAX_CHUNK_COUNT || total < plan.expected_chunks {
                            let err = SensorError::decode(
                                format!("completion names {total} chunks, expected {}", plan.expected_chunks),
                                &raw,
                            );
                            ctx.malformed(command, &err);
                            continue;
                        }

                        if chunks.is_complete(total) {
                            let data = match chunks.assemble(total, plan.data_len) {
                                Ok(data) => data,
                                Err(err) => {
                                    ctx.malformed(command, &err);
                                    continue;
                                }
                            };
                            first_chunk.succeed();
                            completion.succeed();
                            nak.succeed();
                            nak_dog.cancel();
                            sleep(timing.ack_delay).await;
                            let ack = ReceiptBitmap(chunks.receipt_bitmap(total)).to_frame()?;
                            if let Err(err) = ctx.send(ack).await {
                                warn!("Final acknowledgement not delivered: {err}");
                            }
                            let waveform = Waveform {
                                data,
                                chunks: total,
                                elapsed: started.map(|t| t.elapsed()).unwrap_or_default(),
                            };
                            info!(
                                "Received {} bytes in {:?} ({:.2} B/ms)",
                                waveform.data.len(),
                                waveform.elapsed,
                                waveform.throughput()
                            );
                            return Ok(waveform);
                        }

                        first_chunk.succeed();
                        completion.succeed();
                        nak.succeed();
                        nak_dog.cancel();

                        let missing = chunks.missing(total);
                        warn!("{} of {total} chunks missing, sending NAK", missing.len());
                        ctx.emit(SessionEvent::ChunksMissing { total, missing });
                        let nak_frame = ReceiptBitmap(chunks.receipt_bitmap(total)).to_frame()?;
                        nak_dog = ctx.arm(timing.nak.with_post_action_delay(plan.transfer), &nak, nak_frame);
                    }
                    other => {
                        let err = SensorError::decode(format!("unexpected {other} frame during download"), &raw);
                        ctx.malformed(command, &err);
                    }
                }
            }
            exit = start_dog.expired() => exit.into_result(command, "request was not answered")?,
            exit = first_chunk_dog.expired() => exit.into_result(command, "no waveform data arrived")?,
            exit = completion_dog.expired() => exit.into_result(command, "transfer did not complete")?,
            exit = nak_dog.expired() => exit.into_result(command, "missing chunks were not resent")?,
        }
    }
}
