//! Serialized command session: at most one exchange is in flight per sensor.
//!
//! Every command runs as one spawned task. Issuing a new command aborts and awaits the
//! previous task first, which tears down its watchdogs and its notification subscription.

use crate::adapters::{
    CalibrationParams, CalibrationResult, DataDetailQuery, DataListQuery, DataListSummary, Decode, EmptyRequest,
    Encode, SampleAck, SampleParams, SelfCheck, SetSystemParamsAck, SystemParams, TemperatureReading,
};
use crate::chunk::ChunkSet;
use crate::config::SessionConfig;
use crate::connection::ConnectionState;
use crate::error::{LinkError, SensorError};
use crate::frame::{Command, Frame};
use crate::link::{DeviceId, DiscoveredDevice, Link, Notifications};
use crate::transfer::download::{self, DownloadStart, TransferPlan, Waveform};
use crate::transfer::upload::{self, FirmwareImage, UpgradeProgress, UpgradeReport, UploadPlan};
use crate::watchdog::{Exchange, RetryPolicy, Watchdog, WatchdogHandle};
use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the session reports besides final results.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ScanStarted,
    DeviceFound(DiscoveredDevice),
    ScanFinished { devices: usize },
    Connected { device: DeviceId, mtu: Option<u16> },
    Disconnected,
    /// The device accepted capture parameters and started sampling.
    SampleAccepted(SampleAck),
    /// A download completed with gaps; a NAK was sent for `missing`.
    ChunksMissing { total: usize, missing: Vec<usize> },
    UpgradeProgress(UpgradeProgress),
    /// The device still lacks `missing` after an upload pass.
    RetransmitRound { round: u32, missing: Vec<usize> },
    /// A frame was ignored because it could not be used.
    MalformedResponse { command: Command, error: String },
}

/// What to do with a frame that fails to decode as the expected response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnMalformed {
    Fail,
    Report,
}

/// Per-operation handle on the session's shared parts, moved into the operation task.
pub(crate) struct OpContext<L: Link> {
    pub link: Arc<L>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub config: SessionConfig,
}

/// Notification stream of one operation; unsubscribes when dropped.
pub(crate) struct Inbound<L: Link> {
    link: Arc<L>,
    rx: Notifications,
}

impl<L: Link> Inbound<L> {
    pub async fn recv(&mut self) -> Result<Bytes, SensorError> {
        let frame = self.rx.recv().await.ok_or(LinkError::StreamClosed)?;
        debug!(bytes = %hex::encode(&frame), "BLE notify");
        Ok(frame)
    }
}

impl<L: Link> Drop for Inbound<L> {
    fn drop(&mut self) {
        self.link.unsubscribe();
    }
}

async fn send_frame<L: Link>(link: &L, frame: Bytes) -> Result<(), SensorError> {
    debug!(bytes = %hex::encode(&frame), "BLE write");
    link.write(frame).await.map_err(SensorError::from)
}

impl<L: Link> OpContext<L> {
    pub async fn subscribe(&self) -> Result<Inbound<L>, SensorError> {
        let rx = self.link.subscribe().await?;
        Ok(Inbound {
            link: Arc::clone(&self.link),
            rx,
        })
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), SensorError> {
        send_frame(&*self.link, frame).await
    }

    pub fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub fn malformed(&self, command: Command, error: &SensorError) {
        warn!("Ignoring frame while waiting for {command}: {error}");
        self.emit(SessionEvent::MalformedResponse {
            command,
            error: error.to_string(),
        });
    }

    /// Start a watchdog that (re)sends `frame` until `exchange` settles.
    pub fn arm(&self, policy: RetryPolicy, exchange: &Exchange, frame: Bytes) -> WatchdogHandle {
        let link = Arc::clone(&self.link);
        Watchdog::new(policy, move || {
            let link = Arc::clone(&link);
            let frame = frame.clone();
            async move { send_frame(&*link, frame).await }
        })
        .spawn(exchange)
    }

    /// Start a watchdog that only waits for `exchange`.
    pub fn arm_idle(&self, policy: RetryPolicy, exchange: &Exchange) -> WatchdogHandle {
        Watchdog::idle(policy).spawn(exchange)
    }

    /// Send `request` under a watchdog and wait for a usable `command` response.
    ///
    /// Frames for other commands are strays and only reported. A frame for `command` that
    /// fails to decode ends the exchange when `on_malformed` is `Fail`.
    #[allow(clippy::too_many_arguments)]
    pub async fn request<T>(
        &self,
        inbound: &mut Inbound<L>,
        request: Bytes,
        command: Command,
        policy: RetryPolicy,
        on_malformed: OnMalformed,
        reason: &'static str,
        decode: impl Fn(&[u8]) -> Result<T, SensorError>,
    ) -> Result<T, SensorError> {
        let exchange = Exchange::new();
        let mut watchdog = self.arm(policy, &exchange, request);
        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let frame = frame?;
                    if frame.get(1) != Some(&u8::from(command)) {
                        let stray = Frame::parse(&frame).err().unwrap_or_else(|| SensorError::FrameCommandMismatch {
                            expected: command.into(),
                            actual: frame[1],
                        });
                        self.malformed(command, &stray);
                        continue;
                    }
                    match decode(&frame) {
                        Ok(value) => {
                            if exchange.succeed() {
                                return Ok(value);
                            }
                        }
                        Err(err) if on_malformed == OnMalformed::Fail => {
                            exchange.succeed();
                            return Err(err);
                        }
                        Err(err) => self.malformed(command, &err),
                    }
                }
                exit = watchdog.expired() => exit.into_result(command, reason)?,
            }
        }
    }
}

/// A protocol session with one sensor over one [`Link`].
pub struct Session<L: Link> {
    link: Arc<L>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    current: Mutex<Option<JoinHandle<()>>>,
    chunks: Arc<Mutex<ChunkSet>>,
    connection: std::sync::Mutex<ConnectionState>,
}

impl<L: Link> Session<L> {
    /// Create a session and the receiver for its events.
    pub fn new(link: L, config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            link: Arc::new(link),
            config,
            events,
            current: Mutex::new(None),
            chunks: Arc::new(Mutex::new(ChunkSet::new())),
            connection: std::sync::Mutex::new(ConnectionState::default()),
        };
        (session, rx)
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Snapshot of the connection bookkeeping.
    pub fn connection(&self) -> ConnectionState {
        self.state().clone()
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn context(&self) -> OpContext<L> {
        OpContext {
            link: Arc::clone(&self.link),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }

    async fn cancel(current: &mut Option<JoinHandle<()>>) {
        if let Some(task) = current.take() {
            if !task.is_finished() {
                debug!("Cancelling superseded operation");
                task.abort();
            }
            let _ = task.await;
        }
    }

    /// Cancel any pending operation and drop its subscription.
    pub async fn release(&self) {
        let mut current = self.current.lock().await;
        Self::cancel(&mut current).await;
        self.link.unsubscribe();
    }

    async fn run<T, F, Fut>(&self, command: Command, job: F) -> Result<T, SensorError>
    where
        T: Send + 'static,
        F: FnOnce(OpContext<L>) -> Fut,
        Fut: Future<Output = Result<T, SensorError>> + Send + 'static,
    {
        let mut current = self.current.lock().await;
        Self::cancel(&mut current).await;
        if !self.link.is_connected() {
            return Err(SensorError::NotConnected);
        }
        info!("Starting {command}");
        let (tx, rx) = oneshot::channel();
        let task = job(self.context());
        *current = Some(tokio::spawn(async move {
            let _ = tx.send(task.await);
        }));
        drop(current);
        rx.await.map_err(|_| SensorError::Superseded)?
    }

    async fn exchange<T, E>(
        &self,
        request: E,
        policy: RetryPolicy,
        on_malformed: OnMalformed,
        reason: &'static str,
        decode: fn(&[u8]) -> Result<T, SensorError>,
    ) -> Result<T, SensorError>
    where
        T: Send + 'static,
        E: Encode,
    {
        let command = request.command();
        let frame = request.to_frame()?;
        self.run(command, move |ctx| async move {
            let mut inbound = ctx.subscribe().await?;
            ctx.request(&mut inbound, frame, command, policy, on_malformed, reason, decode)
                .await
        })
        .await
    }

    /// Scan for sensors. Unnamed devices are skipped and repeats are merged.
    pub async fn scan(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, SensorError> {
        self.release().await;
        self.state().begin_scan();
        self.emit(SessionEvent::ScanStarted);
        info!("Scanning for {:?}", window);
        let found = self.link.scan(window).await;

        let mut state = self.state();
        state.finish_scan();
        for device in found? {
            if state.record(device.clone()) {
                self.emit(SessionEvent::DeviceFound(device));
            }
        }
        self.emit(SessionEvent::ScanFinished {
            devices: state.devices().len(),
        });
        Ok(state.devices().to_vec())
    }

    /// Connect to `device` and negotiate the MTU. Connecting to the current device is a no-op.
    pub async fn connect(&self, device: &DeviceId) -> Result<(), SensorError> {
        self.release().await;
        if self.link.is_connected() {
            if self.state().is_current(device) {
                debug!(%device, "Already connected");
                return Ok(());
            }
            self.link.disconnect().await?;
            self.state().clear_connected();
        }

        info!(%device, "Connecting");
        self.link.connect(device).await?;
        tokio::time::sleep(self.config.timing.connect_settle).await;
        let mtu = match self.link.request_mtu(self.config.preferred_mtu).await {
            Ok(mtu) => {
                info!("MTU negotiated: {mtu}");
                Some(mtu)
            }
            Err(e) => {
                warn!("MTU request failed, keeping the default: {e}");
                None
            }
        };
        self.state().set_connected(device.clone());
        self.emit(SessionEvent::Connected {
            device: device.clone(),
            mtu,
        });
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), SensorError> {
        self.release().await;
        let result = self.link.disconnect().await;
        self.state().clear_connected();
        self.emit(SessionEvent::Disconnected);
        result.map_err(SensorError::from)
    }

    pub async fn system_params(&self) -> Result<SystemParams, SensorError> {
        self.exchange(
            EmptyRequest(Command::GetSystemParams),
            self.config.timing.control,
            OnMalformed::Fail,
            "system parameters were not returned",
            SystemParams::decode,
        )
        .await
    }

    pub async fn set_system_params(&self, params: &SystemParams) -> Result<(), SensorError> {
        self.exchange(
            params.clone(),
            self.config.timing.control,
            OnMalformed::Fail,
            "system parameters were not acknowledged",
            SetSystemParamsAck::decode,
        )
        .await
        .map(|_| ())
    }

    pub async fn self_check(&self) -> Result<SelfCheck, SensorError> {
        self.exchange(
            EmptyRequest(Command::SelfCheck),
            self.config.timing.self_check,
            OnMalformed::Fail,
            "self-check report was not returned",
            SelfCheck::decode,
        )
        .await
    }

    /// Ask the node to stop sampling. Any well-formed reply counts as success.
    pub async fn stop_sampling(&self) -> Result<(), SensorError> {
        self.exchange(
            EmptyRequest(Command::StopSampling),
            self.config.timing.control,
            OnMalformed::Report,
            "stop was not acknowledged",
            |raw| Frame::parse(raw).map(|_| ()),
        )
        .await
    }

    pub async fn sample_temperature(&self, emissivity: f32) -> Result<TemperatureReading, SensorError> {
        self.exchange(
            SampleParams::temperature(emissivity),
            self.config.timing.sampling,
            OnMalformed::Fail,
            "temperature was not returned",
            TemperatureReading::decode,
        )
        .await
    }

    pub async fn calibrate(&self, params: CalibrationParams) -> Result<CalibrationResult, SensorError> {
        let policy = RetryPolicy {
            retries: 1,
            timeout: params.timeout(self.config.freq_coefficient),
            ..self.config.timing.control
        };
        self.exchange(
            params,
            policy,
            OnMalformed::Fail,
            "calibration did not finish",
            CalibrationResult::decode,
        )
        .await
    }

    /// Summarize stored captures. Malformed replies are reported and waited past.
    pub async fn data_list(&self, query: DataListQuery) -> Result<DataListSummary, SensorError> {
        self.exchange(
            query,
            self.config.timing.control,
            OnMalformed::Report,
            "data list was not returned",
            DataListSummary::decode,
        )
        .await
    }

    /// Capture a waveform and download it.
    pub async fn sample(&self, params: SampleParams) -> Result<Waveform, SensorError> {
        params.validate()?;
        let plan = TransferPlan::for_capture(&params, self.config.freq_coefficient)?;
        let request = params.to_frame()?;
        let chunks = Arc::clone(&self.chunks);
        self.run(Command::SamplingParams, move |ctx| async move {
            let mut chunks = chunks.lock_owned().await;
            download::receive(&ctx, &mut chunks, request, plan, DownloadStart::Capture).await
        })
        .await
    }

    /// Download a stored capture.
    pub async fn fetch_record(&self, query: DataDetailQuery) -> Result<Waveform, SensorError> {
        let plan = TransferPlan::for_record(&query)?;
        let request = query.to_frame()?;
        let chunks = Arc::clone(&self.chunks);
        self.run(Command::DataDetailQuery, move |ctx| async move {
            let mut chunks = chunks.lock_owned().await;
            download::receive(&ctx, &mut chunks, request, plan, DownloadStart::Record).await
        })
        .await
    }

    /// Push a firmware image, retransmitting whatever the device reports missing.
    pub async fn upgrade(&self, image: FirmwareImage) -> Result<UpgradeReport, SensorError> {
        let plan = UploadPlan::new(&image.data)?;
        self.run(Command::PrepareUpgrade, move |ctx| async move {
            upload::send(&ctx, image, plan).await
        })
        .await
    }
}

impl<L: Link> Drop for Session<L> {
    fn drop(&mut self) {
        if let Some(task) = self.current.get_mut().take() {
            task.abort();
        }
        self.link.unsubscribe();
    }
}
