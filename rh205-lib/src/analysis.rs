//! Turn raw captures into engineering units and summary statistics.
//!
//! Integration and spectra come from a [`Dsp`] backend; everything around them (scaling,
//! detrending, band limits, oversampling, statistics, export) lives here.

use crate::adapters::SampleParams;
use crate::error::SensorError;
use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lowest band edge the integrators accept.
pub const MIN_LOWER_HZ: f64 = 10.0;
/// Upper band edges that need oversampling before double integration.
const OVERSAMPLED_UPPER_HZ: [f64; 2] = [100.0, 200.0];
const OVERSAMPLE: usize = 5;
/// Export full scale: the largest magnitude maps to this count.
const EXPORT_FULL_SCALE: f64 = 16384.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SignalKind {
    /// g
    #[default]
    #[strum(to_string = "acceleration")]
    Acceleration,
    /// mm/s
    #[strum(to_string = "velocity")]
    Velocity,
    /// µm
    #[strum(to_string = "displacement")]
    Displacement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Domain {
    #[default]
    #[strum(to_string = "waveform")]
    Waveform,
    #[strum(to_string = "spectrum")]
    Spectrum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Statistic {
    #[strum(to_string = "RMS")]
    Rms,
    #[strum(to_string = "peak")]
    Peak,
    #[strum(to_string = "peak-to-peak")]
    PeakToPeak,
    #[strum(to_string = "kurtosis")]
    Kurtosis,
}

/// Numerical backend for integration and spectra.
pub trait Dsp {
    /// Band-limited single integration of acceleration.
    fn integrate(&self, signal: &[f64], sampling_hz: f64, lower_hz: f64, upper_hz: f64) -> Result<Vec<f64>, SensorError>;

    /// Band-limited double integration of acceleration.
    fn double_integrate(
        &self,
        signal: &[f64],
        sampling_hz: f64,
        lower_hz: f64,
        upper_hz: f64,
    ) -> Result<Vec<f64>, SensorError>;

    /// Single-sided amplitude spectrum.
    fn spectrum(&self, signal: &[f64], sampling_hz: f64) -> Result<Vec<f64>, SensorError>;
}

/// Backend for acceleration waveforms only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDsp;

impl NoDsp {
    fn unsupported(what: &str) -> SensorError {
        SensorError::Analysis(format!("{what} requires a DSP backend"))
    }
}

impl Dsp for NoDsp {
    fn integrate(&self, _: &[f64], _: f64, _: f64, _: f64) -> Result<Vec<f64>, SensorError> {
        Err(Self::unsupported("velocity"))
    }

    fn double_integrate(&self, _: &[f64], _: f64, _: f64, _: f64) -> Result<Vec<f64>, SensorError> {
        Err(Self::unsupported("displacement"))
    }

    fn spectrum(&self, _: &[f64], _: f64) -> Result<Vec<f64>, SensorError> {
        Err(Self::unsupported("spectrum"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnalysisConfig {
    /// g per ADC count.
    pub acc_coefficient: f64,
    pub analysis_hz: f64,
    pub freq_coefficient: f64,
    pub signal: SignalKind,
    pub domain: Domain,
    pub lower_hz: f64,
    /// Defaults to the analysis bandwidth.
    pub upper_hz: Option<f64>,
}

impl AnalysisConfig {
    /// Defaults for a capture taken with `params`.
    pub fn for_capture(params: &SampleParams, freq_coefficient: f32) -> Result<Self, SensorError> {
        let acc_coefficient = params
            .axis
            .acc_coefficient()
            .ok_or_else(|| SensorError::Analysis("temperature captures carry no waveform".to_string()))?;
        Ok(Self {
            acc_coefficient,
            analysis_hz: params.analysis_hz() as f64,
            freq_coefficient: freq_coefficient as f64,
            signal: SignalKind::Acceleration,
            domain: Domain::Waveform,
            lower_hz: MIN_LOWER_HZ,
            upper_hz: None,
        })
    }

    pub fn with_signal(mut self, signal: SignalKind) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_band(mut self, lower_hz: f64, upper_hz: Option<f64>) -> Self {
        self.lower_hz = lower_hz;
        self.upper_hz = upper_hz;
        self
    }

    pub fn sampling_hz(&self) -> f64 {
        self.analysis_hz * self.freq_coefficient
    }

    fn band(&self) -> (f64, f64) {
        (self.lower_hz.max(MIN_LOWER_HZ), self.upper_hz.unwrap_or(self.analysis_hz))
    }
}

/// Staged signal with its axis spacing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Analysis {
    pub signal: SignalKind,
    pub domain: Domain,
    pub values: Vec<f64>,
    /// Seconds per point for waveforms, Hz per line for spectra.
    pub dx: f64,
}

/// Decode little-endian i16 samples.
pub fn samples(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2).map(|p| i16::from_le_bytes([p[0], p[1]])).collect()
}

fn upsample(signal: &[f64], factor: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(signal.len() * factor);
    for pair in signal.windows(2) {
        let step = (pair[1] - pair[0]) / factor as f64;
        out.extend((0..factor).map(|k| pair[0] + step * k as f64));
    }
    if let Some(&last) = signal.last() {
        out.extend(std::iter::repeat_n(last, factor));
    }
    out
}

/// Run the staging pipeline over raw capture bytes.
pub fn analyze<D: Dsp>(raw: &[u8], config: &AnalysisConfig, dsp: &D) -> Result<Analysis, SensorError> {
    let counts = samples(raw);
    if counts.is_empty() {
        return Err(SensorError::Analysis("capture holds no samples".to_string()));
    }
    let sampling_hz = config.sampling_hz();
    if sampling_hz <= 0.0 {
        return Err(SensorError::Analysis("sampling rate must be positive".to_string()));
    }

    let mean = counts.iter().map(|&c| c as f64).sum::<f64>() / counts.len() as f64;
    let acceleration: Vec<f64> = counts
        .iter()
        .map(|&c| (c as f64 - mean) * config.acc_coefficient)
        .collect();

    let (lower, upper) = config.band();
    let staged = match config.signal {
        SignalKind::Acceleration => acceleration,
        SignalKind::Velocity => dsp
            .integrate(&acceleration, sampling_hz, lower, upper)?
            .into_iter()
            .map(|v| v * 1000.0)
            .collect(),
        SignalKind::Displacement if OVERSAMPLED_UPPER_HZ.contains(&upper) => {
            let dense = upsample(&acceleration, OVERSAMPLE);
            dsp.double_integrate(&dense, sampling_hz * OVERSAMPLE as f64, lower, upper)?
                .into_iter()
                .step_by(OVERSAMPLE)
                .map(|v| v * 1_000_000.0)
                .collect()
        }
        SignalKind::Displacement => dsp
            .double_integrate(&acceleration, sampling_hz, lower, upper)?
            .into_iter()
            .map(|v| v * 1_000_000.0)
            .collect(),
    };

    match config.domain {
        Domain::Waveform => Ok(Analysis {
            signal: config.signal,
            domain: Domain::Waveform,
            values: staged,
            dx: 1.0 / sampling_hz,
        }),
        Domain::Spectrum => {
            let lines = (counts.len() as f64 / config.freq_coefficient) as usize;
            let mut values = dsp.spectrum(&staged, sampling_hz)?;
            values.truncate(lines);
            Ok(Analysis {
                signal: config.signal,
                domain: Domain::Spectrum,
                values,
                dx: sampling_hz / counts.len() as f64,
            })
        }
    }
}

impl Analysis {
    pub fn statistic(&self, statistic: Statistic) -> f64 {
        match statistic {
            Statistic::Rms => self.rms(),
            Statistic::Peak => self.peak(),
            Statistic::PeakToPeak => self.max() - self.min(),
            Statistic::Kurtosis => self.kurtosis(),
        }
    }

    pub fn rms(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        (self.values.iter().map(|v| v * v).sum::<f64>() / self.values.len() as f64).sqrt()
    }

    pub fn peak(&self) -> f64 {
        self.values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
    }

    /// Fourth standardized moment; 1.5 for a pure sine, 3 for Gaussian noise.
    pub fn kurtosis(&self) -> f64 {
        let rms = self.rms();
        if rms == 0.0 {
            return 0.0;
        }
        let fourth = self.values.iter().map(|v| v.powi(4)).sum::<f64>() / self.values.len() as f64;
        fourth / rms.powi(4)
    }

    pub fn min(&self) -> f64 {
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Extent of the x axis.
    pub fn x_max(&self) -> f64 {
        self.dx * self.values.len() as f64
    }

    /// Scale to big-endian i16 counts; returns the bytes and the unit per count.
    pub fn export(&self) -> (Bytes, f64) {
        let peak = self.peak();
        let coefficient = if peak > 0.0 { peak / EXPORT_FULL_SCALE } else { 1.0 };
        let mut out = BytesMut::with_capacity(self.values.len() * 2);
        for v in &self.values {
            out.put_i16((v / coefficient).round() as i16);
        }
        (out.freeze(), coefficient)
    }
}
