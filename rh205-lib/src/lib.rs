pub mod adapters;
pub mod analysis;
pub mod bitmap;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod frame;
pub mod link;
pub mod session;
pub mod sim;
pub mod transfer;
pub mod watchdog;


// Re-export the session types for easy access
pub use config::{SessionConfig, Timing};
pub use error::{LinkError, SensorError};
pub use link::{DeviceId, DiscoveredDevice, Link};
pub use session::{Session, SessionEvent};
pub use transfer::{FirmwareImage, UpgradeReport, Waveform};
