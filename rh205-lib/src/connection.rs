use crate::link::{DeviceId, DiscoveredDevice};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Connection bookkeeping owned by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionState {
    pub current: Option<DeviceId>,
    pub scanning: bool,
    devices: Vec<DiscoveredDevice>,
}

impl ConnectionState {
    /// Start a new scan. The connected device, if any, stays listed first.
    pub fn begin_scan(&mut self) {
        self.scanning = true;
        let current = self.current.clone();
        self.devices.retain(|d| Some(&d.id) == current.as_ref());
    }

    pub fn finish_scan(&mut self) {
        self.scanning = false;
    }

    /// Add an advertisement. Unnamed devices are skipped; a device already listed only has
    /// its signal strength refreshed. Returns true if the device was new.
    pub fn record(&mut self, device: DiscoveredDevice) -> bool {
        if device.name.as_deref().is_none_or(str::is_empty) {
            return false;
        }
        match self.devices.iter_mut().find(|d| d.id == device.id) {
            Some(known) => {
                known.rssi = device.rssi;
                false
            }
            None => {
                self.devices.push(device);
                true
            }
        }
    }

    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    pub fn set_connected(&mut self, device: DeviceId) {
        self.current = Some(device);
    }

    pub fn clear_connected(&mut self) {
        self.current = None;
    }

    pub fn is_current(&self, device: &DeviceId) -> bool {
        self.current.as_ref() == Some(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(mac: &str, name: Option<&str>, rssi: i16) -> DiscoveredDevice {
        DiscoveredDevice {
            id: DeviceId::from(mac),
            name: name.map(str::to_string),
            rssi,
        }
    }

    #[test]
    fn test_scan_deduplicates_by_identity() {
        let mut state = ConnectionState::default();
        state.begin_scan();
        assert!(state.record(device("AA:01", Some("RH205-1"), -60)));
        assert!(!state.record(device("AA:01", Some("RH205-1"), -40)));
        assert!(state.record(device("AA:02", Some("RH205-2"), -70)));
        state.finish_scan();
        assert_eq!(state.devices().len(), 2);
        assert_eq!(state.devices()[0].rssi, -40);
        assert!(!state.scanning);
    }

    #[test]
    fn test_unnamed_devices_are_skipped() {
        let mut state = ConnectionState::default();
        assert!(!state.record(device("AA:03", None, -50)));
        assert!(!state.record(device("AA:04", Some(""), -50)));
        assert!(state.devices().is_empty());
    }

    #[test]
    fn test_new_scan_keeps_connected_device() {
        let mut state = ConnectionState::default();
        state.record(device("AA:01", Some("RH205-1"), -60));
        state.record(device("AA:02", Some("RH205-2"), -60));
        state.set_connected(DeviceId::from("AA:02"));
        state.begin_scan();
        assert_eq!(state.devices().len(), 1);
        assert_eq!(state.devices()[0].id, DeviceId::from("AA:02"));
    }
}
