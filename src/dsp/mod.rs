//! Spectral analysis and noise gating
//!
//! - Framed STFT helpers with matched forward/inverse scaling
//! - Noise floor estimation from a clip's leading segment
//! - Soft spectral gating with overlap-add resynthesis

pub mod gate;
pub mod profile;
pub mod stft;

pub use gate::{GateParams, SpectralGateProcessor};
pub use profile::{NoiseProfile, NoiseProfileEstimator, DEFAULT_PROFILE_WINDOW_MS};
pub use stft::{AnalysisConfig, Stft, WindowKind};

use crate::error::ProcessingError;
use crate::models::{AudioClip, ProcessedClip};
use std::sync::Arc;

/// Estimate the noise floor from the head of `clip`, then gate the clip
///
/// The profile is always computed before gating starts.
pub fn reduce_noise(
    clip: Arc<AudioClip>,
    analysis: AnalysisConfig,
    profile_window_ms: u32,
    params: &GateParams,
) -> Result<ProcessedClip, ProcessingError> {
    let mut estimator = NoiseProfileEstimator::new(analysis)?;
    let profile = Arc::new(estimator.estimate(&clip, profile_window_ms));
    let mut processor = SpectralGateProcessor::new(analysis)?;
    processor.denoise_clip(clip, profile, params)
}
