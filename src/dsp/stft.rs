//! Short-time Fourier transform helpers shared by the estimator, the gate
//! and the visualiser.
//!
//! Forward and inverse transforms are both scaled by `1/sqrt(N)` so that
//! `inverse(forward(x))` reproduces the windowed frame.

use crate::error::ProcessingError;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Minimum FFT size supported
pub const MIN_FFT_SIZE: usize = 64;

/// Maximum FFT size supported
pub const MAX_FFT_SIZE: usize = 8192;

pub const DEFAULT_FFT_SIZE: usize = 2048;
pub const DEFAULT_HOP_SIZE: usize = 512;

/// Supported analysis windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Hann (Hanning) window
    #[default]
    Hann,
    /// Hamming window, never reaches zero at the edges
    Hamming,
}

impl WindowKind {
    /// Generate window coefficients for the given size
    pub fn generate(&self, size: usize) -> Vec<f32> {
        let mut window = vec![0.0; size];
        match self {
            WindowKind::Hann => hann_window_into(&mut window),
            WindowKind::Hamming => hamming_window_into(&mut window),
        }
        window
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowKind::Hann => f.write_str("hann"),
            WindowKind::Hamming => f.write_str("hamming"),
        }
    }
}

fn hann_window_into(window: &mut [f32]) {
    let size = window.len();
    if size < 2 {
        window.fill(1.0);
        return;
    }

    let scale = std::f32::consts::TAU / (size - 1) as f32;
    for (i, w) in window.iter_mut().enumerate() {
        *w = 0.5 * (1.0 - (i as f32 * scale).cos());
    }
}

fn hamming_window_into(window: &mut [f32]) {
    let size = window.len();
    if size < 2 {
        window.fill(1.0);
        return;
    }

    let scale = std::f32::consts::TAU / (size - 1) as f32;
    for (i, w) in window.iter_mut().enumerate() {
        *w = 0.54 - 0.46 * (i as f32 * scale).cos();
    }
}

/// Frame size, hop and window shared by every spectral stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub fft_size: usize,
    pub hop_size: usize,
    pub window: WindowKind,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            hop_size: DEFAULT_HOP_SIZE,
            window: WindowKind::Hann,
        }
    }
}

impl AnalysisConfig {
    /// Number of non-redundant bins of a real spectrum
    pub fn bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    pub fn validate(&self) -> Result<(), ProcessingError> {
        if !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&self.fft_size)
            || !self.fft_size.is_power_of_two()
        {
            return Err(ProcessingError::InvalidParameter(format!(
                "FFT size {} must be a power of two between {} and {}",
                self.fft_size, MIN_FFT_SIZE, MAX_FFT_SIZE
            )));
        }
        if self.hop_size == 0 || self.hop_size > self.fft_size / 2 {
            return Err(ProcessingError::InvalidParameter(format!(
                "hop size {} must be between 1 and {}",
                self.hop_size,
                self.fft_size / 2
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for AnalysisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fft / {} hop / {}", self.fft_size, self.hop_size, self.window)
    }
}

/// Planned forward/inverse transforms plus the analysis window
#[derive(Clone)]
pub struct Stft {
    config: AnalysisConfig,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl Stft {
    pub fn new(config: AnalysisConfig) -> Result<Self, ProcessingError> {
        config.validate()?;

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(config.fft_size);
        let inverse = planner.plan_fft_inverse(config.fft_size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Ok(Self {
            config,
            window: config.window.generate(config.fft_size),
            forward,
            inverse,
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        })
    }

    pub fn config(&self) -> AnalysisConfig {
        self.config
    }

    pub fn window(&self) -> &[f32] {
        &self.window
    }

    /// Window `frame` and transform it into `spectrum`
    ///
    /// `frame` may be shorter than the FFT size; the remainder is zero-padded.
    pub fn forward(&mut self, frame: &[f32], spectrum: &mut Vec<Complex32>) {
        let n = self.config.fft_size;
        spectrum.clear();
        spectrum.extend((0..n).map(|i| {
            let sample = frame.get(i).copied().unwrap_or(0.0);
            Complex32::new(sample * self.window[i], 0.0)
        }));

        self.forward.process_with_scratch(spectrum, &mut self.scratch);

        let scale = 1.0 / (n as f32).sqrt();
        for bin in spectrum.iter_mut() {
            *bin *= scale;
        }
    }

    /// Transform a full spectrum back into real samples
    pub fn inverse(&mut self, spectrum: &mut [Complex32], output: &mut Vec<f32>) {
        let n = self.config.fft_size;
        self.inverse.process_with_scratch(spectrum, &mut self.scratch);

        let scale = 1.0 / (n as f32).sqrt();
        output.clear();
        output.extend(spectrum.iter().map(|c| c.re * scale));
    }
}

/// Magnitudes of the non-redundant half of a spectrum
pub fn half_magnitudes(spectrum: &[Complex32]) -> Vec<f32> {
    let bins = spectrum.len() / 2 + 1;
    spectrum[..bins].iter().map(|c| c.norm()).collect()
}

/// Frame start offsets covering `len` samples with whole frames
///
/// Always yields at least one offset so a short signal becomes a single
/// zero-padded frame.
pub fn frame_offsets(len: usize, fft_size: usize, hop_size: usize) -> Vec<usize> {
    if len <= fft_size {
        return vec![0];
    }
    (0..=len - fft_size).step_by(hop_size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window_shape() {
        let w = WindowKind::Hann.generate(64);
        assert!(w[0].abs() < 1e-6);
        assert!(w[63].abs() < 1e-6);
        assert!(w.iter().all(|&x| (0.0..=1.0).contains(&x)));
        let hamming = WindowKind::Hamming.generate(64);
        assert!((hamming[0] - 0.08).abs() < 1e-4);
    }

    #[test]
    fn test_config_validation() {
        assert!(AnalysisConfig::default().validate().is_ok());
        let bad_size = AnalysisConfig {
            fft_size: 1000,
            ..Default::default()
        };
        assert!(bad_size.validate().is_err());
        let bad_hop = AnalysisConfig {
            hop_size: 2048,
            ..Default::default()
        };
        assert!(bad_hop.validate().is_err());
        assert_eq!(AnalysisConfig::default().bins(), 1025);
    }

    #[test]
    fn test_forward_inverse_reconstructs_windowed_frame() {
        let config = AnalysisConfig {
            fft_size: 256,
            hop_size: 64,
            window: WindowKind::Hann,
        };
        let mut stft = Stft::new(config).unwrap();
        let frame: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();

        let mut spectrum = Vec::new();
        stft.forward(&frame, &mut spectrum);
        let mut out = Vec::new();
        stft.inverse(&mut spectrum, &mut out);

        for (i, (&o, &x)) in out.iter().zip(frame.iter()).enumerate() {
            let expected = x * stft.window()[i];
            assert!((o - expected).abs() < 1e-4, "sample {i}: {o} vs {expected}");
        }
    }

    #[test]
    fn test_offsets_cover_short_and_long_signals() {
        assert_eq!(frame_offsets(100, 256, 64), vec![0]);
        assert_eq!(frame_offsets(256, 256, 64), vec![0]);
        assert_eq!(frame_offsets(384, 256, 64), vec![0, 64, 128]);
    }
}
