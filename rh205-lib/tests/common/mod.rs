//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use rh205_lib::adapters::*;
#[allow(unused_imports)]
pub use rh205_lib::error::{LinkError, SensorError};
#[allow(unused_imports)]
pub use rh205_lib::frame::{Command, Direction, Frame, pack, unpack};
#[allow(unused_imports)]
pub use rh205_lib::session::{Session, SessionEvent};
#[allow(unused_imports)]
pub use rh205_lib::sim::{SimConfig, SimulatedSensor};
#[allow(unused_imports)]
pub use rh205_lib::{SessionConfig, Timing};
#[allow(unused_imports)]
pub use std::time::Duration;
#[allow(unused_imports)]
pub use tokio::sync::mpsc::UnboundedReceiver;

use rh205_lib::link::{DeviceId, DiscoveredDevice, Link, Notifications};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Route library logs to the test harness; repeated calls are fine.
#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A session over a simulated sensor, plus a second handle on the sensor for inspection.
#[allow(dead_code)]
pub fn sim_session(config: SimConfig) -> (Session<SimulatedSensor>, SimulatedSensor, UnboundedReceiver<SessionEvent>) {
    init_logging();
    let sensor = SimulatedSensor::new(config);
    let (session, events) = Session::new(sensor.clone(), SessionConfig::default());
    (session, sensor, events)
}

/// Everything emitted so far.
#[allow(dead_code)]
pub fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// A valid device reply frame.
#[allow(dead_code)]
pub fn device_frame(command: Command, payload: &[u8]) -> Bytes {
    pack(payload, Direction::DeviceToHost, command).unwrap()
}

#[derive(Default)]
struct Script {
    replies: HashMap<Command, VecDeque<Vec<(Duration, Bytes)>>>,
    failing: HashSet<Command>,
    subscriber: Option<mpsc::UnboundedSender<Bytes>>,
    written: Vec<Bytes>,
}

/// A link that answers writes with prepared frames, for orderings the simulator never
/// produces on its own.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct ScriptedLink {
    script: Arc<Mutex<Script>>,
}

#[allow(dead_code)]
impl ScriptedLink {
    /// Answer the next write of `command` with `frames`, each delayed from the one before.
    pub fn on(self, command: Command, frames: Vec<(Duration, Bytes)>) -> Self {
        self.script
            .lock()
            .unwrap()
            .replies
            .entry(command)
            .or_default()
            .push_back(frames);
        self
    }

    /// Writes of `command` fail at the link.
    pub fn fail_writes(self, command: Command) -> Self {
        self.script.lock().unwrap().failing.insert(command);
        self
    }

    /// Host frames of one command, including failed writes.
    pub fn written_frames(&self, command: Command) -> Vec<Frame> {
        self.script
            .lock()
            .unwrap()
            .written
            .iter()
            .filter_map(|raw| Frame::parse(raw).ok())
            .filter(|frame| frame.command == command)
            .collect()
    }
}

impl Link for ScriptedLink {
    fn is_connected(&self) -> bool {
        true
    }

    fn write(&self, frame: Bytes) -> impl Future<Output = Result<(), LinkError>> + Send {
        let script = Arc::clone(&self.script);
        async move {
            let command = Frame::parse(&frame).map(|f| f.command).ok();
            let burst = {
                let mut state = script.lock().unwrap();
                state.written.push(frame);
                let Some(command) = command else {
                    return Ok(());
                };
                if state.failing.contains(&command) {
                    return Err(LinkError::Write(format!("{command} write refused")));
                }
                state.replies.get_mut(&command).and_then(VecDeque::pop_front)
            };
            if let Some(burst) = burst {
                tokio::spawn(async move {
                    for (delay, reply) in burst {
                        tokio::time::sleep(delay).await;
                        let subscriber = script.lock().unwrap().subscriber.clone();
                        if let Some(tx) = subscriber {
                            let _ = tx.send(reply);
                        }
                    }
                });
            }
            Ok(())
        }
    }

    fn subscribe(&self) -> impl Future<Output = Result<Notifications, LinkError>> + Send {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().subscriber = Some(tx);
        async move { Ok(rx) }
    }

    fn unsubscribe(&self) {
        self.script.lock().unwrap().subscriber = None;
    }

    fn scan(&self, _window: Duration) -> impl Future<Output = Result<Vec<DiscoveredDevice>, LinkError>> + Send {
        async { Ok(Vec::new()) }
    }

    fn connect(&self, _device: &DeviceId) -> impl Future<Output = Result<(), LinkError>> + Send {
        async { Ok(()) }
    }

    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send {
        async { Ok(()) }
    }

    fn request_mtu(&self, mtu: u16) -> impl Future<Output = Result<u16, LinkError>> + Send {
        async move { Ok(mtu) }
    }
}
