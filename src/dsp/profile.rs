//! Noise floor estimation from the leading segment of a clip
//!
//! The first few milliseconds of a capture are assumed to be room noise
//! recorded before the speaker starts. Averaging the magnitude spectra of
//! several overlapping frames over that segment smooths out transients.

use super::stft::{frame_offsets, half_magnitudes, AnalysisConfig, Stft, WindowKind};
use crate::error::ProcessingError;
use crate::models::AudioClip;
use log::debug;

/// Default length of the leading segment used for estimation
pub const DEFAULT_PROFILE_WINDOW_MS: u32 = 100;

/// Mean magnitude per frequency bin of a clip's leading segment
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseProfile {
    magnitudes: Vec<f32>,
    analysis: AnalysisConfig,
    sample_rate: u32,
    channels: u16,
    frame_count: usize,
}

impl NoiseProfile {
    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitudes
    }

    pub fn bins(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn fft_size(&self) -> usize {
        self.analysis.fft_size
    }

    pub fn hop_size(&self) -> usize {
        self.analysis.hop_size
    }

    pub fn window(&self) -> WindowKind {
        self.analysis.window
    }

    pub fn analysis(&self) -> AnalysisConfig {
        self.analysis
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of analysis frames averaged into the profile
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Centre frequency of a bin in Hz
    pub fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate as f32 / self.analysis.fft_size as f32
    }

    /// Mean magnitude over all bins
    pub fn mean_magnitude(&self) -> f32 {
        if self.magnitudes.is_empty() {
            return 0.0;
        }
        self.magnitudes.iter().sum::<f32>() / self.magnitudes.len() as f32
    }
}

/// Derives a [`NoiseProfile`] from a clip
pub struct NoiseProfileEstimator {
    stft: Stft,
}

impl NoiseProfileEstimator {
    pub fn new(analysis: AnalysisConfig) -> Result<Self, ProcessingError> {
        Ok(Self {
            stft: Stft::new(analysis)?,
        })
    }

    pub fn analysis(&self) -> AnalysisConfig {
        self.stft.config()
    }

    /// Estimate the noise floor from the first `profile_window_ms` of `clip`
    pub fn estimate(&mut self, clip: &AudioClip, profile_window_ms: u32) -> NoiseProfile {
        let analysis = self.stft.config();
        let bins = analysis.bins();

        let segment_frames = (clip.sample_rate() as u64 * profile_window_ms as u64 / 1000) as usize;
        let segment_frames = segment_frames.min(clip.frames());

        let mut sums = vec![0.0f64; bins];
        let mut frame_count = 0usize;
        let mut spectrum = Vec::with_capacity(analysis.fft_size);

        for channel in 0..clip.channels() as usize {
            let mut signal = clip.channel(channel);
            signal.truncate(segment_frames);

            for offset in frame_offsets(signal.len(), analysis.fft_size, analysis.hop_size) {
                let end = (offset + analysis.fft_size).min(signal.len());
                self.stft.forward(&signal[offset..end], &mut spectrum);
                for (sum, magnitude) in sums.iter_mut().zip(half_magnitudes(&spectrum)) {
                    *sum += magnitude as f64;
                }
                frame_count += 1;
            }
        }

        let magnitudes = sums
            .into_iter()
            .map(|sum| (sum / frame_count as f64) as f32)
            .collect();

        debug!(
            "noise profile from {} frames ({} samples/channel, {})",
            frame_count, segment_frames, analysis
        );

        NoiseProfile {
            magnitudes,
            analysis,
            sample_rate: clip.sample_rate(),
            channels: clip.channels(),
            frame_count,
        }
    }
}
