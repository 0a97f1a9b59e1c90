//! An in-process RH205 that implements [`Link`] and answers like the real node.
//!
//! Used by the integration tests and the demo binary. Faults are injected through
//! [`SimConfig`]: dropped chunks, muted commands, corrupted replies and refused upgrades.

use crate::adapters::{
    CalibrationResult, CompletionReport, ComponentStatus, DataChunk, DataDetailQuery, DataListSummary, Encode,
    PrepareUpgrade, ReceiptBitmap, SampleAck, SampleParams, SelfCheck, SystemParams, TemperatureReading,
    UpgradeChunk,
};
use crate::adapters::{Axis, Decode};
use crate::bitmap;
use crate::constants::{CHUNK_LEN, PREFERRED_MTU, UPLOAD_BITMAP_LEN};
use crate::error::LinkError;
use crate::frame::{Command, Direction, Frame, pack};
use crate::link::{DeviceId, DiscoveredDevice, Link, Notifications};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::f64::consts::PI;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay before every reply.
    pub latency: Duration,
    /// Delay between acknowledging a capture and streaming it.
    pub capture_delay: Duration,
    /// Gap between streamed chunks.
    pub chunk_gap: Duration,
    pub identity: DiscoveredDevice,
    /// Other advertisers seen during a scan.
    pub neighbours: Vec<DiscoveredDevice>,
    pub start_connected: bool,
    pub max_mtu: u16,
    pub system_params: SystemParams,
    pub self_check: SelfCheck,
    pub temperature: f32,
    pub calibration: f32,
    pub data_list: DataListSummary,
    pub records: BTreeMap<u32, Bytes>,
    /// Download chunks lost on their first transmission only.
    pub drop_download_once: BTreeSet<usize>,
    /// Upload chunks lost on their first transmission only.
    pub drop_upload_once: BTreeSet<usize>,
    /// Upload chunks that never arrive.
    pub lost_upload: BTreeSet<usize>,
    /// Commands that are never answered.
    pub mute: HashSet<Command>,
    /// Commands whose first reply carries a bad checksum.
    pub corrupt_once: HashSet<Command>,
    pub reject_upgrade: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(5),
            capture_delay: Duration::from_millis(20),
            chunk_gap: Duration::from_millis(1),
            identity: DiscoveredDevice {
                id: DeviceId::from("C4:7F:51:00:20:05"),
                name: Some("RH205-0042".to_string()),
                rssi: -58,
            },
            neighbours: Vec::new(),
            start_connected: true,
            max_mtu: PREFERRED_MTU,
            system_params: SystemParams {
                channel: 1,
                lora_rx_mhz: 470.3,
                lora_tx_mhz: 470.3,
                tx_power: 20,
                ble_name: "RH205-0042".to_string(),
                serial: 20_240_042,
                mcu_version: [1, 0],
                ad_version: 3,
                firmware_main: 2,
                firmware_sub: 1,
                acc_coe_z: 1.0,
                acc_coe_x: 1.0,
                acc_coe_y: 1.0,
            },
            self_check: SelfCheck {
                node_type: 2,
                serial: 20_240_042,
                rtc: ComponentStatus::Normal,
                ad: ComponentStatus::Normal,
                mems: ComponentStatus::Normal,
                flash: ComponentStatus::Normal,
                temperature: ComponentStatus::Normal,
                lora: ComponentStatus::Normal,
                lora_signal: -72,
                ble_signal: -58,
            },
            temperature: 36.5,
            calibration: 0.0374,
            data_list: DataListSummary {
                count: 0,
                oldest: None,
                newest: None,
            },
            records: BTreeMap::new(),
            drop_download_once: BTreeSet::new(),
            drop_upload_once: BTreeSet::new(),
            lost_upload: BTreeSet::new(),
            mute: HashSet::new(),
            corrupt_once: HashSet::new(),
            reject_upgrade: false,
        }
    }
}

impl SimConfig {
    pub fn drop_download_once(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.drop_download_once.extend(indices);
        self
    }

    pub fn drop_upload_once(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.drop_upload_once.extend(indices);
        self
    }

    pub fn lose_upload(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.lost_upload.extend(indices);
        self
    }

    pub fn mute(mut self, command: Command) -> Self {
        self.mute.insert(command);
        self
    }

    pub fn corrupt_once(mut self, command: Command) -> Self {
        self.corrupt_once.insert(command);
        self
    }

    pub fn with_record(mut self, id: u32, data: impl Into<Bytes>) -> Self {
        self.records.insert(id, data.into());
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.start_connected = false;
        self
    }
}

/// Deterministic test signal: `points` little-endian i16 samples.
pub fn waveform(points: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(points * 2);
    for i in 0..points {
        let t = i as f64 / 32.0;
        let value = (2.0 * PI * t).sin() * 8000.0 + (6.0 * PI * t).sin() * 1500.0;
        out.extend_from_slice(&(value as i16).to_le_bytes());
    }
    out.freeze()
}

/// Split `data` into chunks, zero-padding the last one like the device does.
fn segment(data: &Bytes) -> Vec<Bytes> {
    data.chunks(CHUNK_LEN)
        .map(|chunk| {
            let mut padded = BytesMut::from(chunk);
            padded.resize(CHUNK_LEN, 0);
            padded.freeze()
        })
        .collect()
}

struct UpgradeState {
    prepare: PrepareUpgrade,
    chunks: Vec<Option<Bytes>>,
}

struct SimState {
    connected: bool,
    subscriber: Option<mpsc::UnboundedSender<Bytes>>,
    subscriptions: usize,
    written: Vec<Bytes>,
    params: SystemParams,
    drop_download_once: BTreeSet<usize>,
    drop_upload_once: BTreeSet<usize>,
    corrupt_once: HashSet<Command>,
    download: Option<Vec<Bytes>>,
    upgrade: Option<UpgradeState>,
    installed: Option<(u32, Bytes)>,
}

struct Inner {
    config: SimConfig,
    state: Mutex<SimState>,
}

#[derive(Clone)]
pub struct SimulatedSensor {
    inner: Arc<Inner>,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedSensor {
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            connected: config.start_connected,
            subscriber: None,
            subscriptions: 0,
            written: Vec::new(),
            params: config.system_params.clone(),
            drop_download_once: config.drop_download_once.clone(),
            drop_upload_once: config.drop_upload_once.clone(),
            corrupt_once: config.corrupt_once.clone(),
            download: None,
            upgrade: None,
            installed: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Every frame the host wrote, oldest first.
    pub fn written(&self) -> Vec<Bytes> {
        self.inner.state().written.clone()
    }

    /// Host frames of one command, parsed.
    pub fn written_frames(&self, command: Command) -> Vec<Frame> {
        self.written()
            .iter()
            .filter_map(|raw| Frame::parse(raw).ok())
            .filter(|frame| frame.command == command)
            .collect()
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.state().subscriber.is_some()
    }

    /// How many times the host opened a notification stream.
    pub fn subscriptions(&self) -> usize {
        self.inner.state().subscriptions
    }

    pub fn system_params(&self) -> SystemParams {
        self.inner.state().params.clone()
    }

    /// Firmware accepted after a CRC-verified upload, with its transfer id.
    pub fn installed_firmware(&self) -> Option<(u32, Bytes)> {
        self.inner.state().installed.clone()
    }

    /// Simulate the radio dropping or restoring the connection.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.inner.state();
        state.connected = connected;
        if !connected {
            state.subscriber = None;
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, frame: Option<Bytes>) {
        let Some(frame) = frame else {
            return;
        };
        if let Some(tx) = self.state().subscriber.as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn frame(&self, command: Command, payload: &[u8]) -> Option<Bytes> {
        let frame = match pack(payload, Direction::DeviceToHost, command) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Sim: cannot frame {command} reply: {err}");
                return None;
            }
        };
        if !self.state().corrupt_once.remove(&command) {
            return Some(frame);
        }
        debug!("Sim: corrupting {command} reply");
        let mut corrupted = BytesMut::from(frame.as_ref());
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        Some(corrupted.freeze())
    }

    fn reply(self: &Arc<Self>, command: Command, payload: &[u8]) {
        let Some(frame) = self.frame(command, payload) else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            sleep(inner.config.latency).await;
            inner.deliver(Some(frame));
        });
    }

    /// Send `indices` of `chunks`, then a completion report naming all of them.
    async fn stream(&self, chunks: &[Bytes], indices: &[usize]) {
        for &index in indices {
            sleep(self.config.chunk_gap).await;
            if self.state().drop_download_once.remove(&index) {
                debug!("Sim: dropping chunk {index}");
                continue;
            }
            let payload = DataChunk {
                index: index as u16,
                data: chunks[index].clone(),
            }
            .to_payload();
            self.deliver(self.frame(Command::DataDetail, &payload));
        }
        sleep(self.config.chunk_gap).await;
        let report = CompletionReport {
            total: chunks.len() as u32,
        };
        self.deliver(self.frame(Command::WaveDataResult, &report.to_payload()));
    }

    fn start_download(self: &Arc<Self>, data: Bytes, ack: bool) {
        let chunks = segment(&data);
        self.state().download = Some(chunks.clone());
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            sleep(inner.config.latency).await;
            if ack {
                let ack = SampleAck { accepted: true }.to_payload();
                inner.deliver(inner.frame(Command::SamplingParams, &ack));
                sleep(inner.config.capture_delay).await;
            }
            let all: Vec<usize> = (0..chunks.len()).collect();
            inner.stream(&chunks, &all).await;
        });
    }

    fn handle(self: &Arc<Self>, raw: Bytes) {
        let frame = match Frame::parse(&raw) {
            Ok(frame) if frame.direction == Direction::HostToDevice => frame,
            Ok(_) | Err(_) => {
                warn!("Sim: ignoring malformed host frame {}", hex::encode(&raw));
                return;
            }
        };
        if self.config.mute.contains(&frame.command) {
            debug!("Sim: {} muted", frame.command);
            return;
        }
        let payload = frame.payload;

        match frame.command {
            Command::GetSystemParams => {
                let params = self.state().params.clone();
                match params.encode_payload() {
                    Ok(p) => self.reply(Command::GetSystemParams, &p),
                    Err(e) => warn!("Sim: cannot encode parameters: {e}"),
                }
            }
            Command::SetSystemParams => {
                let status = match SystemParams::decode_payload(&payload) {
                    Ok(params) => {
                        self.state().params = params;
                        1
                    }
                    Err(_) => 0,
                };
                self.reply(Command::SetSystemParams, &[status]);
            }
            Command::SelfCheck => self.reply(Command::SelfCheck, &self.config.self_check.to_payload()),
            Command::StopSampling => {
                self.state().download = None;
                self.reply(Command::StopSampling, &[]);
            }
            Command::SamplingParams => match SampleParams::from_payload(&payload) {
                Ok(params) if params.axis == Axis::Temperature => {
                    let reading = TemperatureReading {
                        celsius: self.config.temperature,
                    };
                    self.reply(Command::SamplingParams, &reading.to_payload());
                }
                Ok(params) => {
                    info!("Sim: capturing {} points on {}", params.points(), params.axis);
                    self.start_download(waveform(params.points()), true);
                }
                Err(_) => self.reply(Command::SamplingParams, &[0]),
            },
            Command::CalibrateVibration => {
                let result = CalibrationResult {
                    coefficient: self.config.calibration,
                };
                self.reply(Command::CalibrateVibration, &result.to_payload());
            }
            Command::DataList => self.reply(Command::DataList, &self.config.data_list.to_payload()),
            Command::DataDetailQuery => {
                let Ok(query) = DataDetailQuery::from_payload(&payload) else {
                    return;
                };
                match self.config.records.get(&query.record) {
                    Some(data) => self.start_download(data.clone(), false),
                    None => warn!("Sim: no record {}", query.record),
                }
            }
            Command::WaveDataResult => self.on_receipt(&payload),
            Command::PrepareUpgrade => {
                let Ok(prepare) = PrepareUpgrade::from_payload(&payload) else {
                    self.reply(Command::PrepareUpgrade, &[0]);
                    return;
                };
                if self.config.reject_upgrade {
                    self.reply(Command::PrepareUpgrade, &[0]);
                    return;
                }
                self.state().upgrade = Some(UpgradeState {
                    prepare,
                    chunks: vec![None; prepare.chunk_count as usize],
                });
                self.reply(Command::PrepareUpgrade, &[1]);
            }
            Command::UpgradeData => self.on_upgrade_chunk(&payload),
            Command::UpgradeDataResult => self.on_upgrade_result(),
            Command::DataDetail => warn!("Sim: host sent a data chunk"),
        }
    }

    fn on_receipt(self: &Arc<Self>, payload: &[u8]) {
        let Ok(ReceiptBitmap(received)) = ReceiptBitmap::from_payload(payload) else {
            return;
        };
        let Some(chunks) = self.state().download.clone() else {
            return;
        };
        let missing = bitmap::missing_indices(&received, chunks.len());
        if missing.is_empty() {
            debug!("Sim: download acknowledged");
            self.state().download = None;
            return;
        }
        debug!("Sim: resending {:?}", missing);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            sleep(inner.config.latency).await;
            inner.stream(&chunks, &missing).await;
        });
    }

    fn on_upgrade_chunk(&self, payload: &Bytes) {
        let Ok(chunk) = UpgradeChunk::from_payload(payload) else {
            return;
        };
        let index = chunk.index as usize;
        if self.config.lost_upload.contains(&index) {
            return;
        }
        let mut state = self.state();
        if state.drop_upload_once.remove(&index) {
            debug!("Sim: dropping firmware chunk {index}");
            return;
        }
        if let Some(slot) = state.upgrade.as_mut().and_then(|u| u.chunks.get_mut(index)) {
            *slot = Some(chunk.data);
        }
    }

    fn on_upgrade_result(self: &Arc<Self>) {
        let mut received = [0u8; UPLOAD_BITMAP_LEN];
        let mut state = self.state();
        let Some(upgrade) = state.upgrade.as_ref() else {
            drop(state);
            self.reply(Command::UpgradeDataResult, &received);
            return;
        };
        for (index, _) in upgrade.chunks.iter().enumerate().filter(|(_, c)| c.is_some()) {
            let _ = bitmap::set_bit(&mut received, index);
        }
        if upgrade.chunks.iter().all(Option::is_some) {
            let image: Vec<u8> = upgrade.chunks.iter().flatten().flat_map(|c| c.iter().copied()).collect();
            let prepare = upgrade.prepare;
            if image.len() == prepare.len as usize && crc32fast::hash(&image) == prepare.crc32 {
                info!("Sim: firmware {} installed ({} bytes)", prepare.transfer_id, image.len());
                state.installed = Some((prepare.transfer_id, Bytes::from(image)));
            } else {
                warn!("Sim: firmware image failed verification");
            }
        }
        drop(state);
        self.reply(Command::UpgradeDataResult, &received);
    }
}

impl Link for SimulatedSensor {
    fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    fn write(&self, frame: Bytes) -> impl Future<Output = Result<(), LinkError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            {
                let mut state = inner.state();
                if !state.connected {
                    return Err(LinkError::NotConnected);
                }
                state.written.push(frame.clone());
            }
            inner.handle(frame);
            Ok(())
        }
    }

    fn subscribe(&self) -> impl Future<Output = Result<Notifications, LinkError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            let mut state = inner.state();
            if !state.connected {
                return Err(LinkError::Subscribe("not connected".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscriber = Some(tx);
            state.subscriptions += 1;
            Ok(rx)
        }
    }

    fn unsubscribe(&self) {
        self.inner.state().subscriber = None;
    }

    fn scan(&self, window: Duration) -> impl Future<Output = Result<Vec<DiscoveredDevice>, LinkError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            sleep(window).await;
            let mut found = vec![inner.config.identity.clone()];
            found.extend(inner.config.neighbours.iter().cloned());
            Ok(found)
        }
    }

    fn connect(&self, device: &DeviceId) -> impl Future<Output = Result<(), LinkError>> + Send {
        let inner = Arc::clone(&self.inner);
        let device = device.clone();
        async move {
            sleep(inner.config.latency).await;
            if device != inner.config.identity.id {
                return Err(LinkError::Connect {
                    device: device.to_string(),
                    reason: "no such device in range".to_string(),
                });
            }
            inner.state().connected = true;
            Ok(())
        }
    }

    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            let mut state = inner.state();
            state.connected = false;
            state.subscriber = None;
            Ok(())
        }
    }

    fn request_mtu(&self, mtu: u16) -> impl Future<Output = Result<u16, LinkError>> + Send {
        let granted = mtu.min(self.inner.config.max_mtu);
        async move { Ok(granted) }
    }
}
