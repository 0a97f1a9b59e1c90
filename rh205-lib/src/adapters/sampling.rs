use super::{Decode, Encode, read_raw, read_status};
use crate::constants::{
    ACC_COE_X, ACC_COE_Y, ACC_COE_Z, DEFAULT_EMISSIVITY, HZ_PER_FREQ_UNIT, POINTS_PER_LEN_UNIT,
};
use crate::error::SensorError;
use crate::frame::Command;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::Duration;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{F32, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Axis {
    #[default]
    #[strum(to_string = "Z")]
    Z = 0,
    #[strum(to_string = "X")]
    X = 1,
    #[strum(to_string = "Y")]
    Y = 2,
    #[strum(to_string = "Temperature")]
    Temperature = 3,
}

impl Axis {
    /// g per ADC count for vibration axes.
    pub fn acc_coefficient(&self) -> Option<f64> {
        match self {
            Axis::Z => Some(ACC_COE_Z),
            Axis::X => Some(ACC_COE_X),
            Axis::Y => Some(ACC_COE_Y),
            Axis::Temperature => None,
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SampleParamsRaw {
    pub len_k: U16,
    pub freq: U16,
    pub axis: u8,
    pub extra: F32, // emissivity, or reference amplitude for calibration
}

/// Start a capture: `len_k` × 1024 points at `freq` × 100 Hz analysis bandwidth.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SampleParams {
    pub len_k: u16,
    pub freq: u16,
    pub axis: Axis,
    pub emissivity: f32,
}

impl SampleParams {
    pub fn new(len_k: u16, freq: u16, axis: Axis) -> Self {
        Self {
            len_k,
            freq,
            axis,
            emissivity: DEFAULT_EMISSIVITY,
        }
    }

    /// One-shot temperature reading.
    pub fn temperature(emissivity: f32) -> Self {
        Self {
            len_k: 0,
            freq: 0,
            axis: Axis::Temperature,
            emissivity,
        }
    }

    pub fn points(&self) -> usize {
        self.len_k as usize * POINTS_PER_LEN_UNIT
    }

    pub fn analysis_hz(&self) -> u32 {
        self.freq as u32 * HZ_PER_FREQ_UNIT
    }

    /// Reject captures the device cannot plan for.
    pub fn validate(&self) -> Result<(), SensorError> {
        if self.axis == Axis::Temperature {
            return Err(SensorError::InvalidParameter(
                "temperature is read with a temperature request, not a waveform capture".to_string(),
            ));
        }
        if self.len_k == 0 || self.freq == 0 {
            return Err(SensorError::InvalidParameter(format!(
                "sampling length and frequency must be non-zero (len {}, freq {})",
                self.len_k, self.freq
            )));
        }
        Ok(())
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: SampleParamsRaw = read_raw(payload, "sampling parameters")?;
        let axis = Axis::try_from(raw.axis)
            .map_err(|_| SensorError::decode(format!("unknown axis {}", raw.axis), payload))?;
        Ok(Self {
            len_k: raw.len_k.get(),
            freq: raw.freq.get(),
            axis,
            emissivity: raw.extra.get(),
        })
    }
}

impl Encode for SampleParams {
    fn command(&self) -> Command {
        Command::SamplingParams
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        let raw = SampleParamsRaw {
            len_k: U16::new(self.len_k),
            freq: U16::new(self.freq),
            axis: self.axis.into(),
            extra: F32::new(self.emissivity),
        };
        Ok(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

/// Device acceptance of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SampleAck {
    pub accepted: bool,
}

impl Decode for SampleAck {
    const COMMAND: Command = Command::SamplingParams;
    const PAYLOAD_LEN: usize = 1;

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let accepted = read_status(payload, "sampling acknowledgement")?;
        if !accepted {
            return Err(SensorError::decode("device refused the capture", payload));
        }
        Ok(Self { accepted })
    }
}

impl SampleAck {
    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.accepted as u8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TemperatureReading {
    pub celsius: f32,
}

impl Decode for TemperatureReading {
    const COMMAND: Command = Command::SamplingParams;
    const PAYLOAD_LEN: usize = 4;

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: F32 = read_raw(payload, "temperature")?;
        let celsius = raw.get();
        if !celsius.is_finite() {
            return Err(SensorError::decode("temperature is not a finite number", payload));
        }
        Ok(Self { celsius })
    }
}

impl TemperatureReading {
    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(F32::new(self.celsius).as_bytes())
    }
}

/// Vibration calibration against a reference excitation of `reference_g`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibrationParams {
    pub len_k: u16,
    pub freq: u16,
    pub axis: Axis,
    pub reference_g: f32,
}

impl CalibrationParams {
    /// Capture time plus one second of margin, using `freq_coefficient` as the ratio of
    /// sampling rate to analysis bandwidth.
    pub fn timeout(&self, freq_coefficient: f32) -> Duration {
        let points = self.len_k as f64 * POINTS_PER_LEN_UNIT as f64;
        let sampling_hz = self.freq as f64 * HZ_PER_FREQ_UNIT as f64 * freq_coefficient as f64;
        let capture = if sampling_hz > 0.0 { points / sampling_hz } else { 0.0 };
        Duration::from_secs_f64(capture) + Duration::from_secs(1)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let params = SampleParams::from_payload(payload)?;
        Ok(Self {
            len_k: params.len_k,
            freq: params.freq,
            axis: params.axis,
            reference_g: params.emissivity,
        })
    }
}

impl Encode for CalibrationParams {
    fn command(&self) -> Command {
        Command::CalibrateVibration
    }

    fn encode_payload(&self) -> Result<Bytes, SensorError> {
        if self.axis == Axis::Temperature {
            return Err(SensorError::InvalidParameter("cannot calibrate the temperature channel".to_string()));
        }
        let raw = SampleParamsRaw {
            len_k: U16::new(self.len_k),
            freq: U16::new(self.freq),
            axis: self.axis.into(),
            extra: F32::new(self.reference_g),
        };
        Ok(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibrationResult {
    pub coefficient: f32,
}

impl Decode for CalibrationResult {
    const COMMAND: Command = Command::CalibrateVibration;
    const PAYLOAD_LEN: usize = 4;

    fn decode_payload(payload: &[u8]) -> Result<Self, SensorError> {
        let raw: F32 = read_raw(payload, "calibration coefficient")?;
        let coefficient = raw.get();
        if !coefficient.is_finite() || coefficient <= 0.0 {
            return Err(SensorError::decode(format!("invalid coefficient {coefficient}"), payload));
        }
        Ok(Self { coefficient })
    }
}

impl CalibrationResult {
    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(F32::new(self.coefficient).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_params_layout() {
        let params = SampleParams::new(4, 20, Axis::X);
        let payload = params.encode_payload().unwrap();
        assert_eq!(payload.len(), 9);
        assert_eq!(&payload[..5], &[0x04, 0x00, 0x14, 0x00, 0x01]);
        assert_eq!(&payload[5..], &0.97f32.to_le_bytes());
        assert_eq!(SampleParams::from_payload(&payload).unwrap(), params);
    }

    #[test]
    fn test_validate_rejects_zero_length() {
        assert!(SampleParams::new(0, 5, Axis::Z).validate().is_err());
        assert!(SampleParams::temperature(0.95).validate().is_err());
        assert!(SampleParams::new(1, 5, Axis::Z).validate().is_ok());
    }

    #[test]
    fn test_calibration_timeout() {
        // 1024 points at 500 Hz * 2.5 = 1250 Hz sampling -> 819.2 ms, plus 1 s
        let params = CalibrationParams {
            len_k: 1,
            freq: 5,
            axis: Axis::Z,
            reference_g: 1.0,
        };
        let timeout = params.timeout(2.5);
        assert_eq!(timeout.as_millis(), 1819);
    }

    #[test]
    fn test_refused_capture_is_decode_failure() {
        let err = SampleAck::decode_payload(&[0]).unwrap_err();
        assert!(err.is_malformed());
        assert!(SampleAck::decode_payload(&[1]).unwrap().accepted);
        assert!(SampleAck::decode_payload(&[7]).is_err());
    }
}
