use super::{Decode, Encode, read_raw, read_status};
use crate::error::SensorError;
use crate::frame::Command;
use bytes::Bytes;
use zerocopy::byteorder::little_endian::{F32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const BLE_NAME_LEN: usize = 20;
/// LoRa channels repeat their TX offset every 8 channels, 200 kHz apart.
const CHANNEL_GROUP: u8 = 8;
const CHANNEL_STEP_MHZ: f64 = 0.2;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SystemParamsRaw {
    pub channel: u8,
    pub lora_rx_hz: U32,
    pub lora_tx_hz: U32,
    pub tx_power: u8,
    pub ble_name: [u8; BLE_NAME_LEN],
    pub serial: U32,
    pub mcu_version: [u8; 2],
    pub ad_version: u8,
    pub firmware_main: U16,
    pub firmware_sub: u8,
    pub reserved0: [u8; 2],
    pub acc_coe_z: F32,
    pub acc_coe_x: F32,
    pub acc_coe_y: F32,
    pub reserved1: [u8; 16],
}

/// Node configuration as stored on the device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemParams {
    /// LoRa channel, 1-based.
    pub channel: u8,
    pub lora_rx_mhz: f64,
    /// Effective transmit frequency; the channel's group offset is applied on the wire.
    pub lora_tx_mhz: f64,
    pub tx_power: u8,
    pub ble_name: String,
    pub serial: u32,
    pub mcu_version: [u8; 2],
    pub ad_version: u8,
    pub firmware_main: u16,
    pub firmware_sub: u8,
    pub acc_coe_z: f32,
    pub acc_coe_x: f32,
    pub acc_coe_y: f32,
}

impl SystemParams {
    fn tx_offset_mhz(channel: u8) -> f64 {
        ((channel - 1) % CHANNEL_GROUP) as f64 * CHANNEL_STEP_MHZ
    }

    pub fn firmware_version(&self) -> String {
        format!("{}.{}", self.firmware_main, self.firmware_sub)
    }
}

fn mhz_to_hz(mhz: f64) -> Result<U32, SensorError> {
    let hz = (mhz * 1_000_000.0).round();
    if !(0.0..=u32::MAX as f64).contains(&hz) {
        return Err(SensorError::InvalidParameter(format!("frequency {mhz} MHz out of range")));
    }
    Ok(U32::new(hz as u32))
}

impl Decode for SystemParams {
    const COMMAND: Command = Command::GetSystemParams;
    const PAYLOAD_LEN: usize = size_of::<SystemParamsRaw>();

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: SystemParamsRaw = read_raw(payload, "system parameters")?;
        if raw.channel == 0 {
            return Err(SensorError::decode("LoRa channel 0 is invalid", payload));
        }
        let name_end = raw.ble_name.iter().position(|&b| b == 0).unwrap_or(BLE_NAME_LEN);
        let ble_name = String::from_utf8_lossy(&raw.ble_name[..name_end]).into_owned();

        Ok(Self {
            channel: raw.channel,
            lora_rx_mhz: raw.lora_rx_hz.get() as f64 / 1_000_000.0,
            lora_tx_mhz: raw.lora_tx_hz.get() as f64 / 1_000_000.0 - Self::tx_offset_mhz(raw.channel),
            tx_power: raw.tx_power,
            ble_name,
            serial: raw.serial.get(),
            mcu_version: raw.mcu_version,
            ad_version: raw.ad_version,
            firmware_main: raw.firmware_main.get(),
            firmware_sub: raw.firmware_sub,
            acc_coe_z: raw.acc_coe_z.get(),
            acc_coe_x: raw.acc_coe_x.get(),
            acc_coe_y: raw.acc_coe_y.get(),
        })
    }
}

impl Encode for SystemParams {
    fn command(&self) -> Command {
        Command::SetSystemParams
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        if self.channel == 0 {
            return Err(SensorError::InvalidParameter("LoRa channel must be at least 1".to_string()));
        }
        let name = self.ble_name.as_bytes();
        if name.len() > BLE_NAME_LEN {
            return Err(SensorError::InvalidParameter(format!(
                "BLE name is {} bytes, limit is {BLE_NAME_LEN}",
                name.len()
            )));
        }
        let mut ble_name = [0u8; BLE_NAME_LEN];
        ble_name[..name.len()].copy_from_slice(name);

        let raw = SystemParamsRaw {
            channel: self.channel,
            lora_rx_hz: mhz_to_hz(self.lora_rx_mhz)?,
            lora_tx_hz: mhz_to_hz(self.lora_tx_mhz + Self::tx_offset_mhz(self.channel))?,
            tx_power: self.tx_power,
            ble_name,
            serial: U32::new(self.serial),
            mcu_version: self.mcu_version,
            ad_version: self.ad_version,
            firmware_main: U16::new(self.firmware_main),
            firmware_sub: self.firmware_sub,
            reserved0: [0; 2],
            acc_coe_z: F32::new(self.acc_coe_z),
            acc_coe_x: F32::new(self.acc_coe_x),
            acc_coe_y: F32::new(self.acc_coe_y),
            reserved1: [0; 16],
        };
        Ok(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

/// Reply to a set-parameters request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSystemParamsAck;

impl Decode for SetSystemParamsAck {
    const COMMAND: Command = Command::SetSystemParams;
    const PAYLOAD_LEN: usize = 1;

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        if !read_status(payload, "set system parameters")? {
            return Err(SensorError::decode("device rejected the system parameters", payload));
        }
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SystemParams {
        SystemParams {
            channel: 3,
            lora_rx_mhz: 470.3,
            lora_tx_mhz: 470.3,
            tx_power: 20,
            ble_name: "RH205-0042".to_string(),
            serial: 0x0102_0304,
            mcu_version: [1, 2],
            ad_version: 4,
            firmware_main: 2,
            firmware_sub: 7,
            acc_coe_z: 1.0,
            acc_coe_x: 0.5,
            acc_coe_y: 0.25,
        }
    }

    #[test]
    fn test_payload_is_seventy_bytes() {
        assert_eq!(SystemParams::PAYLOAD_LEN, 70);
        assert_eq!(params().encode_payload().unwrap().len(), 70);
    }

    #[test]
    fn test_tx_frequency_carries_channel_offset() {
        let payload = params().encode_payload().unwrap();
        // channel 3 -> offset 0.4 MHz on the wire
        let tx = u32::from_le_bytes(payload[5..9].try_into().unwrap());
        assert_eq!(tx, 470_700_000);
        let decoded = SystemParams::decode_payload(&payload).unwrap();
        assert!((decoded.lora_tx_mhz - 470.3).abs() < 1e-6);
        assert_eq!(decoded.ble_name, "RH205-0042");
        assert_eq!(decoded.firmware_version(), "2.7");
    }

    #[test]
    fn test_overlong_name_rejected() {
        let mut p = params();
        p.ble_name = "X".repeat(21);
        assert!(matches!(p.encode_payload(), Err(SensorError::InvalidParameter(_))));
    }

    #[test]
    fn test_channel_zero_is_malformed() {
        let mut payload = params().encode_payload().unwrap().to_vec();
        payload[0] = 0;
        assert!(SystemParams::decode_payload(&payload).unwrap_err().is_malformed());
    }
}
