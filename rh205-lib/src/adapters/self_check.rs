use super::{Decode, read_raw};
use crate::error::SensorError;
use crate::frame::Command;
use bytes::Bytes;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ComponentStatus {
    #[strum(to_string = "normal")]
    Normal,
    #[strum(to_string = "abnormal")]
    Abnormal,
}

impl ComponentStatus {
    fn from_raw(value: u8, component: &str, payload: &[u8]) -> Result<Self, SensorError> {
        match value {
            0x01 => Ok(ComponentStatus::Normal),
            0x00 => Ok(ComponentStatus::Abnormal),
            other => Err(SensorError::decode(
                format!("{component} status {other:#04x} is not a status code"),
                payload,
            )),
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            ComponentStatus::Normal => 0x01,
            ComponentStatus::Abnormal => 0x00,
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SelfCheckRaw {
    pub node_type: u8,
    pub serial: U32,
    pub rtc: u8,
    pub ad: u8,
    pub mems: u8,
    pub flash: u8,
    pub temperature: u8,
    pub lora: u8,
    pub lora_signal: i8, // dBm
    pub ble_signal: i8,  // dBm
    pub reserved: [u8; 2],
}

/// Hardware self-test report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SelfCheck {
    pub node_type: u8,
    pub serial: u32,
    pub rtc: ComponentStatus,
    pub ad: ComponentStatus,
    pub mems: ComponentStatus,
    pub flash: ComponentStatus,
    pub temperature: ComponentStatus,
    pub lora: ComponentStatus,
    pub lora_signal: i8,
    pub ble_signal: i8,
}

impl SelfCheck {
    pub fn all_normal(&self) -> bool {
        [self.rtc, self.ad, self.mems, self.flash, self.temperature, self.lora]
            .iter()
            .all(|s| *s == ComponentStatus::Normal)
    }

    pub fn to_payload(&self) -> Bytes {
        let raw = SelfCheckRaw {
            node_type: self.node_type,
            serial: U32::new(self.serial),
            rtc: self.rtc.to_raw(),
            ad: self.ad.to_raw(),
            mems: self.mems.to_raw(),
            flash: self.flash.to_raw(),
            temperature: self.temperature.to_raw(),
            lora: self.lora.to_raw(),
            lora_signal: self.lora_signal,
            ble_signal: self.ble_signal,
            reserved: [0; 2],
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }
}

impl Decode for SelfCheck {
    const COMMAND: Command = Command::SelfCheck;
    const PAYLOAD_LEN: usize = size_of::<SelfCheckRaw>();

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: SelfCheckRaw = read_raw(payload, "self-check")?;
        Ok(Self {
            node_type: raw.node_type,
            serial: raw.serial.get(),
            rtc: ComponentStatus::from_raw(raw.rtc, "RTC", payload)?,
            ad: ComponentStatus::from_raw(raw.ad, "AD", payload)?,
            mems: ComponentStatus::from_raw(raw.mems, "MEMS", payload)?,
            flash: ComponentStatus::from_raw(raw.flash, "flash", payload)?,
            temperature: ComponentStatus::from_raw(raw.temperature, "temperature", payload)?,
            lora: ComponentStatus::from_raw(raw.lora, "LoRa", payload)?,
            lora_signal: raw.lora_signal,
            ble_signal: raw.ble_signal,
        })
    }
}
