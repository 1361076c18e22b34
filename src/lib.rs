//! voxgate - record a short voice sample, gate its background noise and
//! compare the result with the original
//!
//! The pipeline is driven by [`state::ComparisonSession`]:
//! capture through an [`audio::InputDevice`], estimate a
//! [`dsp::NoiseProfile`] from the leading segment, apply the spectral gate
//! off the async workers, then play either version through an
//! [`audio::OutputDevice`] while [`visual::VisualizationRenderer`] turns
//! the playhead into spectrum bars.

pub mod audio;
pub mod dsp;
pub mod error;
pub mod models;
pub mod settings;
pub mod state;
pub mod visual;

pub use error::{ErrorKind, SessionError};
pub use models::{AudioClip, Phase, PlaybackChannel, ProcessedClip};
pub use state::{ComparisonSession, SessionConfig};
