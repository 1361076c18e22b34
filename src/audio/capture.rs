//! Microphone capture lifecycle
//!
//! Opens the input device with voice-processing hints, buffers the raw
//! chunks it delivers, enforces the recording length cap and turns the
//! collected bytes into an [`AudioClip`] once the device has flushed.

use super::codec;
use super::device::{
    CaptureConstraints, CaptureEvent, CaptureSink, InputDevice, InputStream, SessionEvent,
    StreamFormat,
};
use crate::error::{DecodeError, SessionError};
use crate::models::AudioClip;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Hard cap on a single recording
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_millis(5000);

/// Progress of one recording; only ever moves forward
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordingPhase {
    Recording,
    /// Stop requested, waiting for the device to flush
    Stopping,
    Finalized,
}

/// Smoothed input level for metering
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InputLevel {
    /// Smoothed RMS (0.0 - 1.0)
    pub rms: f32,
    /// Peak with slow decay
    pub peak: f32,
}

/// State carried between start and clip production
pub struct RecordingSession {
    generation: u64,
    stream: Box<dyn InputStream>,
    format: StreamFormat,
    buffer: Vec<u8>,
    chunks: usize,
    phase: RecordingPhase,
    deadline: Option<JoinHandle<()>>,
    started: Instant,
    level: InputLevel,
}

impl RecordingSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> RecordingPhase {
        self.phase
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Audio buffered so far
    pub fn buffered(&self) -> Duration {
        let frame_bytes = self.format.channels as usize * std::mem::size_of::<f32>();
        let frames = self.buffer.len() / frame_bytes.max(1);
        Duration::from_secs_f64(frames as f64 / self.format.sample_rate.max(1) as f64)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn append(&mut self, bytes: Vec<u8>) {
        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .filter(|s| s.is_finite())
            .collect();
        if !samples.is_empty() {
            let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
            let max = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
            self.level.rms = self.level.rms * 0.7 + rms * 0.3;
            self.level.peak = (self.level.peak * 0.95).max(max);
        }

        self.buffer.extend_from_slice(&bytes);
        self.chunks += 1;
    }

    fn cancel_deadline(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }

    fn release(&mut self) {
        self.cancel_deadline();
        self.stream.release();
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns at most one [`RecordingSession`] at a time
pub struct CaptureController {
    constraints: CaptureConstraints,
    max_duration: Duration,
    active: Option<RecordingSession>,
}

impl CaptureController {
    pub fn new(constraints: CaptureConstraints, max_duration: Duration) -> Self {
        Self {
            constraints,
            max_duration,
            active: None,
        }
    }

    pub fn constraints(&self) -> &CaptureConstraints {
        &self.constraints
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.active.as_ref()
    }

    pub fn phase(&self) -> Option<RecordingPhase> {
        self.active.as_ref().map(|s| s.phase)
    }

    pub fn level(&self) -> InputLevel {
        self.active.as_ref().map(|s| s.level).unwrap_or_default()
    }

    /// Whether an input device track is still open
    pub fn is_holding_device(&self) -> bool {
        self.active.as_ref().is_some_and(|s| s.stream.is_live())
    }

    /// Open the device and start buffering
    ///
    /// Arms the auto-stop timer, which posts
    /// [`SessionEvent::CaptureDeadline`] for `generation` when it fires.
    pub async fn start<I: InputDevice>(
        &mut self,
        device: &mut I,
        generation: u64,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<(), SessionError> {
        self.abort();

        let sink = CaptureSink::new(generation, events.clone());
        let stream = device.open(&self.constraints, sink).await?;
        let format = stream.format();

        let max_duration = self.max_duration;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            let _ = events.send(SessionEvent::CaptureDeadline { generation });
        });

        info!(
            "recording started at {} (cap {} ms)",
            format,
            max_duration.as_millis()
        );

        self.active = Some(RecordingSession {
            generation,
            stream,
            format,
            buffer: Vec::new(),
            chunks: 0,
            phase: RecordingPhase::Recording,
            deadline: Some(deadline),
            started: Instant::now(),
            level: InputLevel::default(),
        });
        Ok(())
    }

    /// Ask the device to flush and stop
    ///
    /// Shared by the manual stop and the auto-stop timer. Only the first
    /// call for a recording has any effect; returns whether this was it.
    pub fn request_stop(&mut self) -> bool {
        let Some(session) = self.active.as_mut() else {
            return false;
        };
        if session.phase != RecordingPhase::Recording {
            return false;
        }

        session.phase = RecordingPhase::Stopping;
        session.cancel_deadline();
        session.stream.request_stop();
        debug!(
            "stop requested after {:?} ({} chunks)",
            session.elapsed(),
            session.chunks
        );
        true
    }

    /// Apply one device event
    ///
    /// Returns the outcome of the recording once the device has stopped or
    /// failed, `None` while it is still running or if the event belongs
    /// to another recording.
    pub fn on_event(
        &mut self,
        generation: u64,
        event: CaptureEvent,
    ) -> Option<Result<AudioClip, SessionError>> {
        let session = self.active.as_mut()?;
        if session.generation != generation {
            debug!("ignoring capture event from generation {}", generation);
            return None;
        }

        match event {
            CaptureEvent::Chunk(bytes) => {
                if session.phase < RecordingPhase::Finalized {
                    session.append(bytes);
                }
                None
            }
            CaptureEvent::Format(format) => {
                if format != session.format {
                    if session.buffer.is_empty() {
                        debug!("input format negotiated: {}", format);
                        session.format = format;
                    } else {
                        warn!(
                            "input format changed mid-recording ({} -> {}), keeping the first",
                            session.format, format
                        );
                    }
                }
                None
            }
            CaptureEvent::Stopped => Some(self.finalize()),
            CaptureEvent::Failed(reason) => {
                self.abort();
                Some(Err(SessionError::DeviceUnavailable(reason)))
            }
        }
    }

    /// Release the device and decode what was collected
    fn finalize(&mut self) -> Result<AudioClip, SessionError> {
        let Some(mut session) = self.active.take() else {
            return Err(SessionError::Decode(DecodeError::Empty));
        };
        session.phase = RecordingPhase::Finalized;
        session.release();

        let clip = codec::decode_raw_f32le(&session.buffer, session.format)?;
        info!(
            "recording finished: {:.2}s from {} chunks",
            clip.duration_seconds(),
            session.chunks
        );
        Ok(clip)
    }

    /// Drop the recording and everything it buffered
    pub fn abort(&mut self) {
        if let Some(mut session) = self.active.take() {
            session.release();
            debug!("recording aborted, discarded {} chunks", session.chunks);
        }
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new(CaptureConstraints::default(), DEFAULT_MAX_DURATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_raw_f32le;
    use crate::audio::simulated::{DeviceAccess, SimulatedInput};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    async fn pump(
        controller: &mut CaptureController,
        rx: &mut UnboundedReceiver<SessionEvent>,
    ) -> Result<AudioClip, SessionError> {
        loop {
            match rx.recv().await {
                Some(SessionEvent::Capture { generation, event }) => {
                    if let Some(result) = controller.on_event(generation, event) {
                        return result;
                    }
                }
                Some(SessionEvent::CaptureDeadline { .. }) => {
                    controller.request_stop();
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_recording() {
        let (tx, mut rx) = unbounded_channel();
        let mut input = SimulatedInput::new();
        let tracks = input.tracks();
        let mut controller = CaptureController::new(
            CaptureConstraints::default(),
            Duration::from_millis(300),
        );

        controller.start(&mut input, 1, tx).await.unwrap();
        assert!(controller.is_holding_device());
        assert_eq!(controller.phase(), Some(RecordingPhase::Recording));

        let clip = pump(&mut controller, &mut rx).await.unwrap();
        let seconds = clip.duration_seconds();
        assert!((0.26..=0.30).contains(&seconds), "{seconds}");
        assert!(!controller.is_holding_device());
        assert_eq!(tracks.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_first_stop_counts() {
        let (tx, _rx) = unbounded_channel();
        let mut input = SimulatedInput::new();
        let mut controller = CaptureController::default();
        controller.start(&mut input, 1, tx).await.unwrap();

        assert!(controller.request_stop());
        assert!(!controller.request_stop());
        assert_eq!(controller.phase(), Some(RecordingPhase::Stopping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_maps_to_session_error() {
        let (tx, _rx) = unbounded_channel();
        let mut input = SimulatedInput::new().with_access(DeviceAccess::Denied);
        let mut controller = CaptureController::default();
        let err = controller.start(&mut input, 1, tx).await.unwrap_err();
        assert_eq!(err, SessionError::PermissionDenied);
        assert!(controller.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_ordered_events() {
        let (tx, _rx) = unbounded_channel();
        let mut input = SimulatedInput::new();
        let mut controller = CaptureController::default();
        controller.start(&mut input, 2, tx).await.unwrap();

        let format = StreamFormat {
            sample_rate: 8000,
            channels: 2,
        };
        assert!(controller.on_event(2, CaptureEvent::Format(format)).is_none());
        let stale = CaptureEvent::Chunk(encode_raw_f32le(&[9.0, 9.0]));
        assert!(controller.on_event(1, stale).is_none());
        let chunk = CaptureEvent::Chunk(encode_raw_f32le(&[0.5, -0.5, 0.25, -0.25]));
        assert!(controller.on_event(2, chunk).is_none());
        assert!(controller.level().peak >= 0.5);
        assert_eq!(controller.session().map(|s| s.chunks()), Some(1));

        let clip = controller.on_event(2, CaptureEvent::Stopped).unwrap().unwrap();
        assert_eq!(clip.sample_rate(), 8000);
        assert_eq!(clip.channels(), 2);
        assert_eq!(clip.samples(), &[0.5, -0.5, 0.25, -0.25]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_recording_is_a_decode_error() {
        let (tx, _rx) = unbounded_channel();
        let mut input = SimulatedInput::new();
        let mut controller = CaptureController::default();
        controller.start(&mut input, 1, tx).await.unwrap();

        let result = controller.on_event(1, CaptureEvent::Stopped).unwrap();
        assert_eq!(result, Err(SessionError::Decode(DecodeError::Empty)));
        assert!(!controller.is_holding_device());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_releases_device() {
        let (tx, _rx) = unbounded_channel();
        let mut input = SimulatedInput::new();
        let tracks = input.tracks();
        let mut controller = CaptureController::default();
        controller.start(&mut input, 1, tx).await.unwrap();
        assert_eq!(tracks.get(), 1);

        controller.abort();
        assert_eq!(tracks.get(), 0);
        assert!(controller.phase().is_none());
    }
}
