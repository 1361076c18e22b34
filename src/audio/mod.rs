//! Audio devices, capture and playback
//!
//! This module provides:
//! - The 16-bit PCM WAV codec and raw capture chunk decoding
//! - Device traits plus simulated and PipeWire implementations
//! - Capture lifecycle with an auto-stop cap
//! - Exclusive A/B playback of two channels
//! - WAV export via the codec

pub mod capture;
pub mod codec;
pub mod device;
pub mod export;
pub mod playback;
#[cfg(feature = "pipewire")]
pub mod pipewire;
pub mod simulated;

pub use capture::{CaptureController, InputLevel, RecordingPhase, RecordingSession};
pub use device::{
    CaptureConstraints, CaptureEvent, CaptureSink, InputDevice, InputStream, OutputDevice,
    OutputStream, PlaybackEndSink, Playhead, SessionEvent, StreamFormat,
};
pub use export::ClipExporter;
pub use playback::{PlayOutcome, PlaybackCoordinator};
#[cfg(feature = "pipewire")]
pub use pipewire::{PipeWireInput, PipeWireOutput};
pub use simulated::{DeviceAccess, SignalSource, SimulatedInput, SimulatedOutput, TrackCounter, VoiceSignal};
