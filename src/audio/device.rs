//! Device seams and the event channel they report through
//!
//! Capture and playback engines run outside the session (tokio tasks or
//! an OS thread) and never call back into it. Everything they have to say
//! is posted as a [`SessionEvent`] on one unbounded FIFO channel, so a
//! stream's chunks always arrive before its stop notification.

use crate::error::{DeviceError, PlaybackError, SessionError};
use crate::models::{AudioClip, ProcessedClip};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Negotiated layout of captured samples
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz / {} ch", self.sample_rate, self.channels)
    }
}

/// Capability hints passed to an input device when it is opened
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Preferred sample rate, device default when unset
    pub sample_rate: Option<u32>,
    /// Preferred channel count, device default when unset
    pub channels: Option<u16>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: None,
            channels: None,
        }
    }
}

/// What a capture stream reports
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Interleaved little-endian `f32` samples
    Chunk(Vec<u8>),
    /// The device (re)negotiated its sample layout
    Format(StreamFormat),
    /// All pending chunks have been delivered
    Stopped,
    /// The stream died
    Failed(String),
}

/// Messages consumed by the session's event loop
#[derive(Debug)]
pub enum SessionEvent {
    Capture { generation: u64, event: CaptureEvent },
    CaptureDeadline { generation: u64 },
    ProcessingDone {
        generation: u64,
        result: Result<ProcessedClip, SessionError>,
    },
    PlaybackEnded { stream_id: u64 },
    /// The output stream died before reaching the end
    PlaybackFailed { stream_id: u64, reason: String },
}

/// Handle a capture stream posts its events through
#[derive(Clone, Debug)]
pub struct CaptureSink {
    generation: u64,
    tx: UnboundedSender<SessionEvent>,
}

impl CaptureSink {
    pub fn new(generation: u64, tx: UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once nobody is listening any more
    pub fn send(&self, event: CaptureEvent) -> bool {
        self.tx
            .send(SessionEvent::Capture {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn chunk(&self, bytes: Vec<u8>) -> bool {
        self.send(CaptureEvent::Chunk(bytes))
    }

    pub fn format(&self, format: StreamFormat) -> bool {
        self.send(CaptureEvent::Format(format))
    }

    pub fn stopped(&self) -> bool {
        self.send(CaptureEvent::Stopped)
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.send(CaptureEvent::Failed(reason.into()))
    }
}

/// Handle an output stream uses to announce it reached the end or died
#[derive(Clone, Debug)]
pub struct PlaybackEndSink {
    stream_id: u64,
    tx: UnboundedSender<SessionEvent>,
}

impl PlaybackEndSink {
    pub fn new(stream_id: u64, tx: UnboundedSender<SessionEvent>) -> Self {
        Self { stream_id, tx }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn ended(&self) {
        let _ = self.tx.send(SessionEvent::PlaybackEnded {
            stream_id: self.stream_id,
        });
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(SessionEvent::PlaybackFailed {
            stream_id: self.stream_id,
            reason: reason.into(),
        });
    }
}

/// A microphone or anything that behaves like one
#[allow(async_fn_in_trait)]
pub trait InputDevice: Send {
    /// Acquire the device and start streaming into `sink`
    ///
    /// May suspend while the user is asked for permission.
    async fn open(
        &mut self,
        constraints: &CaptureConstraints,
        sink: CaptureSink,
    ) -> Result<Box<dyn InputStream>, DeviceError>;
}

/// An open capture stream
pub trait InputStream: Send {
    /// Layout the stream was opened with
    fn format(&self) -> StreamFormat;

    /// Ask the device to flush and post [`CaptureEvent::Stopped`]
    fn request_stop(&mut self);

    /// Give the device back; must be idempotent
    fn release(&mut self);

    /// Whether the device is still held
    fn is_live(&self) -> bool;
}

/// Something that can play a clip
pub trait OutputDevice: Send {
    fn start(
        &mut self,
        clip: Arc<AudioClip>,
        ended: PlaybackEndSink,
    ) -> Result<Box<dyn OutputStream>, PlaybackError>;
}

/// One clip being played
pub trait OutputStream: Send {
    fn playhead(&self) -> Arc<dyn Playhead>;

    /// Silence the stream; must be idempotent
    fn stop(&mut self);
}

/// Current position of an output stream, in sample frames
pub trait Playhead: Send + Sync {
    fn position(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_constraints_default_to_voice_hints() {
        let c = CaptureConstraints::default();
        assert!(c.echo_cancellation && c.noise_suppression && c.auto_gain_control);
        let parsed: CaptureConstraints =
            serde_json::from_str(r#"{"auto_gain_control": false}"#).unwrap();
        assert!(!parsed.auto_gain_control);
        assert!(parsed.echo_cancellation);
    }

    #[test]
    fn test_sinks_tag_their_events() {
        let (tx, mut rx) = unbounded_channel();
        let sink = CaptureSink::new(7, tx.clone());
        assert!(sink.chunk(vec![0; 4]));
        assert!(sink.stopped());
        let ended = PlaybackEndSink::new(3, tx);
        assert_eq!(ended.stream_id(), 3);
        ended.ended();
        ended.failed("sink removed");

        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Capture {
                generation: 7,
                event: CaptureEvent::Chunk(_)
            })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Capture {
                generation: 7,
                event: CaptureEvent::Stopped
            })
        ));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::PlaybackEnded { stream_id: 3 })));
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::PlaybackFailed { stream_id: 3, reason }) if reason == "sink removed"
        ));

        drop(rx);
        assert!(!sink.failed("gone"));
    }
}
