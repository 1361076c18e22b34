use crate::dsp::NoiseProfile;
use crate::error::{ClipError, ProcessingError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Decoded PCM audio
///
/// Samples are interleaved `f32` in roughly `[-1.0, 1.0]`. A clip is never
/// mutated after construction; transformations build new clips.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    sample_rate: u32,
    channels: u16,
    samples: Arc<[f32]>,
}

impl AudioClip {
    /// Create a clip from interleaved samples
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Result<Self, ClipError> {
        if sample_rate == 0 {
            return Err(ClipError::ZeroSampleRate);
        }
        if channels == 0 {
            return Err(ClipError::ZeroChannels);
        }
        if samples.len() % channels as usize != 0 {
            return Err(ClipError::RaggedFrames {
                samples: samples.len(),
                channels,
            });
        }
        Ok(Self {
            sample_rate,
            channels,
            samples: samples.into(),
        })
    }

    /// Create a clip from one buffer per channel
    pub fn from_planar(sample_rate: u32, planes: &[Vec<f32>]) -> Result<Self, ClipError> {
        let channels = u16::try_from(planes.len()).map_err(|_| ClipError::ZeroChannels)?;
        if channels == 0 {
            return Err(ClipError::ZeroChannels);
        }
        let frames = planes[0].len();
        if planes.iter().any(|p| p.len() != frames) {
            return Err(ClipError::UnevenChannels);
        }

        let mut interleaved = Vec::with_capacity(frames * planes.len());
        for i in 0..frames {
            for plane in planes {
                interleaved.push(plane[i]);
            }
        }
        Self::new(sample_rate, channels, interleaved)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Total sample count across all channels
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Sample frames (one sample per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_seconds())
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Copy one channel out as a planar buffer
    pub fn channel(&self, index: usize) -> Vec<f32> {
        let channels = self.channels as usize;
        if index >= channels {
            return Vec::new();
        }
        self.samples
            .iter()
            .skip(index)
            .step_by(channels)
            .copied()
            .collect()
    }

    /// Average all channels into one
    pub fn mixdown(&self) -> Vec<f32> {
        mixdown_range(self, 0, self.frames())
    }
}

/// Mono mix of the frames in `[start, end)`
pub(crate) fn mixdown_range(clip: &AudioClip, start: usize, end: usize) -> Vec<f32> {
    let channels = clip.channels as usize;
    let end = end.min(clip.frames());
    if start >= end {
        return Vec::new();
    }
    clip.samples[start * channels..end * channels]
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// A denoised clip together with what it was derived from
#[derive(Debug, Clone)]
pub struct ProcessedClip {
    clip: AudioClip,
    source: Arc<AudioClip>,
    profile: Arc<NoiseProfile>,
}

impl ProcessedClip {
    /// Pair an output clip with its provenance
    ///
    /// Fails if the output does not have the shape of its source.
    pub fn new(
        clip: AudioClip,
        source: Arc<AudioClip>,
        profile: Arc<NoiseProfile>,
    ) -> Result<Self, ProcessingError> {
        if clip.sample_rate() != source.sample_rate()
            || clip.channels() != source.channels()
            || clip.sample_count() != source.sample_count()
        {
            return Err(ProcessingError::InvalidParameter(format!(
                "processed clip shape {}Hz/{}ch/{} differs from source {}Hz/{}ch/{}",
                clip.sample_rate(),
                clip.channels(),
                clip.sample_count(),
                source.sample_rate(),
                source.channels(),
                source.sample_count()
            )));
        }
        Ok(Self {
            clip,
            source,
            profile,
        })
    }

    pub fn clip(&self) -> &AudioClip {
        &self.clip
    }

    pub fn source(&self) -> &Arc<AudioClip> {
        &self.source
    }

    pub fn profile(&self) -> &Arc<NoiseProfile> {
        &self.profile
    }
}

/// One of the two tracks exposed for comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackChannel {
    Original,
    Processed,
}

impl PlaybackChannel {
    pub const ALL: [PlaybackChannel; 2] = [PlaybackChannel::Original, PlaybackChannel::Processed];

    pub fn other(self) -> PlaybackChannel {
        match self {
            PlaybackChannel::Original => PlaybackChannel::Processed,
            PlaybackChannel::Processed => PlaybackChannel::Original,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            PlaybackChannel::Original => 0,
            PlaybackChannel::Processed => 1,
        }
    }
}

impl std::fmt::Display for PlaybackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackChannel::Original => f.write_str("original"),
            PlaybackChannel::Processed => f.write_str("processed"),
        }
    }
}

/// Lifecycle state of a comparison session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Recording,
    Captured,
    Processing,
    Ready,
    Error,
}

impl Phase {
    /// Phases that resolve on their own without caller input
    pub fn is_transient(self) -> bool {
        matches!(self, Phase::Recording | Phase::Captured | Phase::Processing)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Recording => "recording",
            Phase::Captured => "captured",
            Phase::Processing => "processing",
            Phase::Ready => "ready",
            Phase::Error => "in error",
        };
        f.write_str(name)
    }
}
