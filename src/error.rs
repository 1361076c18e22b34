//! Error taxonomy for the capture → denoise → compare pipeline
//!
//! Every failure a session can surface maps onto one [`ErrorKind`]. The
//! narrower enums below carry the detail for each concern.

use crate::models::{Phase, PlaybackChannel};
use serde::Serialize;
use thiserror::Error;

/// The five operation failures a session can end up in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    DecodeError,
    ProcessingError,
    PlaybackError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::DeviceUnavailable => "device unavailable",
            ErrorKind::DecodeError => "decode error",
            ErrorKind::ProcessingError => "processing error",
            ErrorKind::PlaybackError => "playback error",
        };
        f.write_str(name)
    }
}

/// Errors raised while turning bytes into an [`AudioClip`](crate::models::AudioClip)
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("input is truncated: {0}")]
    Truncated(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("no audio was captured")]
    Empty,

    #[error("sample {index} is not a finite number")]
    NonFinite { index: usize },

    #[error("invalid clip: {0}")]
    InvalidClip(#[from] ClipError),
}

impl From<hound::Error> for DecodeError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                DecodeError::Truncated(io.to_string())
            }
            hound::Error::IoError(io) => DecodeError::MalformedHeader(io.to_string()),
            hound::Error::FormatError(msg) => DecodeError::MalformedHeader(msg.to_string()),
            hound::Error::TooWide => {
                DecodeError::UnsupportedFormat("sample does not fit in 32 bits".to_string())
            }
            hound::Error::Unsupported => {
                DecodeError::UnsupportedFormat("not an integer PCM stream".to_string())
            }
            other => DecodeError::MalformedHeader(other.to_string()),
        }
    }
}

/// Violations of the [`AudioClip`](crate::models::AudioClip) invariants
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClipError {
    #[error("sample rate must be greater than zero")]
    ZeroSampleRate,

    #[error("channel count must be at least one")]
    ZeroChannels,

    #[error("{samples} samples do not divide into {channels} channels")]
    RaggedFrames { samples: usize, channels: u16 },

    #[error("planar channels have different lengths")]
    UnevenChannels,

    #[error("{samples} samples are too many for a WAV file")]
    TooLong { samples: usize },
}

/// Failures of noise estimation or spectral gating
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProcessingError {
    #[error("profile was computed for {profile_rate} Hz / {profile_channels} ch, clip is {clip_rate} Hz / {clip_channels} ch")]
    MetadataMismatch {
        profile_rate: u32,
        profile_channels: u16,
        clip_rate: u32,
        clip_channels: u16,
    },

    #[error("profile analysis ({profile}) does not match processor analysis ({processor})")]
    AnalysisMismatch { profile: String, processor: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("non-finite value in {0}")]
    NumericalInstability(&'static str),

    #[error("processing worker failed: {0}")]
    WorkerFailed(String),
}

/// Failures starting or driving playback
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("{0} audio is not available yet")]
    Unavailable(PlaybackChannel),

    #[error("output device failed: {0}")]
    Device(String),
}

/// What an input device can report while being opened
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("access to the audio input was denied")]
    PermissionDenied,

    #[error("no audio input device: {0}")]
    Unavailable(String),
}

/// Error surfaced by [`ComparisonSession`](crate::state::ComparisonSession) operations
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("access to the microphone was denied")]
    PermissionDenied,

    #[error("no audio input device available: {0}")]
    DeviceUnavailable(String),

    #[error("failed to decode audio: {0}")]
    Decode(#[from] DecodeError),

    #[error("noise reduction failed: {0}")]
    Processing(#[from] ProcessingError),

    #[error("playback failed: {0}")]
    Playback(#[from] PlaybackError),

    #[error("cannot {action} while the session is {phase}")]
    InvalidPhase { action: &'static str, phase: Phase },
}

impl SessionError {
    /// The taxonomy entry for this error, `None` for caller misuse
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SessionError::PermissionDenied => Some(ErrorKind::PermissionDenied),
            SessionError::DeviceUnavailable(_) => Some(ErrorKind::DeviceUnavailable),
            SessionError::Decode(_) => Some(ErrorKind::DecodeError),
            SessionError::Processing(_) => Some(ErrorKind::ProcessingError),
            SessionError::Playback(_) => Some(ErrorKind::PlaybackError),
            SessionError::InvalidPhase { .. } => None,
        }
    }
}

impl From<DeviceError> for SessionError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::PermissionDenied => SessionError::PermissionDenied,
            DeviceError::Unavailable(msg) => SessionError::DeviceUnavailable(msg),
        }
    }
}
