//! The wireless transport as seen by the protocol engine.
//!
//! Platform BLE stacks implement [`Link`]; the engine only writes whole frames and reads
//! notification payloads.

use crate::error::LinkError;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Inbound notification payloads, one frame per item.
pub type Notifications = mpsc::UnboundedReceiver<Bytes>;

/// Stable device identity, typically the MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
}

pub trait Link: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    /// Write one frame to the device.
    fn write(&self, frame: Bytes) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Open the notification stream. Only one stream is live per connection; subscribing
    /// again replaces the previous one, which then ends.
    fn subscribe(&self) -> impl Future<Output = Result<Notifications, LinkError>> + Send;

    fn unsubscribe(&self);

    /// Scan for `window` and report every advertisement seen.
    fn scan(&self, window: Duration) -> impl Future<Output = Result<Vec<DiscoveredDevice>, LinkError>> + Send;

    fn connect(&self, device: &DeviceId) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Negotiate the MTU; returns the value granted.
    fn request_mtu(&self, mtu: u16) -> impl Future<Output = Result<u16, LinkError>> + Send;
}
