//! In-process capture and playback devices
//!
//! These stand in for real hardware: the input emits a voice-like test
//! signal (or replays a clip) in real time on a tokio task, and the output
//! "plays" a clip by letting the clock run for its duration. Both keep a
//! count of live tracks so callers can check nothing was left open.

use super::codec::encode_raw_f32le;
use super::device::{
    CaptureConstraints, CaptureSink, InputDevice, InputStream, OutputDevice, OutputStream,
    PlaybackEndSink, Playhead, StreamFormat,
};
use crate::error::{DeviceError, PlaybackError};
use crate::models::AudioClip;
use log::{debug, info};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

/// How often the simulated microphone delivers a chunk
pub const DEFAULT_CHUNK_PERIOD: Duration = Duration::from_millis(20);

/// Number of device tracks currently held open
#[derive(Clone, Debug, Default)]
pub struct TrackCounter(Arc<AtomicUsize>);

impl TrackCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcome of asking the simulated device for access
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceAccess {
    #[default]
    Granted,
    /// The user declined the permission prompt
    Denied,
    /// No input device is present
    Absent,
}

/// A few seconds of "room noise, then someone talking"
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceSignal {
    /// Noise-only lead-in before the voice starts
    pub lead_ms: u32,
    pub pitch_hz: f32,
    pub voice_amplitude: f32,
    pub noise_amplitude: f32,
    pub seed: u32,
}

impl Default for VoiceSignal {
    fn default() -> Self {
        Self {
            lead_ms: 500,
            pitch_hz: 180.0,
            voice_amplitude: 0.4,
            noise_amplitude: 0.02,
            seed: 0x5eed,
        }
    }
}

/// What the simulated microphone hears
#[derive(Clone, Debug)]
pub enum SignalSource {
    Voice(VoiceSignal),
    /// Replay a clip, then end the stream
    Clip(Arc<AudioClip>),
}

enum Generator {
    Voice {
        signal: VoiceSignal,
        format: StreamFormat,
        position: usize,
        state: u32,
    },
    Clip {
        clip: Arc<AudioClip>,
        position: usize,
    },
}

impl Generator {
    fn new(source: &SignalSource, format: StreamFormat) -> Self {
        match source {
            SignalSource::Voice(signal) => Generator::Voice {
                signal: *signal,
                format,
                position: 0,
                state: signal.seed.max(1),
            },
            SignalSource::Clip(clip) => Generator::Clip {
                clip: clip.clone(),
                position: 0,
            },
        }
    }

    /// Next `frames` interleaved frames, `None` once a replayed clip is done
    fn next_chunk(&mut self, frames: usize) -> Option<Vec<f32>> {
        match self {
            Generator::Voice {
                signal,
                format,
                position,
                state,
            } => {
                let rate = format.sample_rate as f64;
                let lead = (format.sample_rate as u64 * signal.lead_ms as u64 / 1000) as usize;
                let mut out = Vec::with_capacity(frames * format.channels as usize);

                for n in *position..*position + frames {
                    let t = n as f64 / rate;
                    let voice = if n >= lead {
                        // three harmonics under a 3 Hz syllable envelope
                        let f = signal.pitch_hz as f64;
                        let envelope = 0.6 + 0.4 * (TAU * 3.0 * t).sin();
                        let tone = (TAU * f * t).sin()
                            + 0.5 * (TAU * 2.0 * f * t).sin()
                            + 0.25 * (TAU * 3.0 * f * t).sin();
                        (envelope * tone / 1.75) as f32 * signal.voice_amplitude
                    } else {
                        0.0
                    };
                    for _ in 0..format.channels {
                        *state ^= *state << 13;
                        *state ^= *state >> 17;
                        *state ^= *state << 5;
                        let noise = (*state as f32 / u32::MAX as f32 * 2.0 - 1.0)
                            * signal.noise_amplitude;
                        out.push(voice + noise);
                    }
                }
                *position += frames;
                Some(out)
            }
            Generator::Clip { clip, position } => {
                if *position >= clip.frames() {
                    return None;
                }
                let end = (*position + frames).min(clip.frames());
                let channels = clip.channels() as usize;
                let out = clip.samples()[*position * channels..end * channels].to_vec();
                *position = end;
                Some(out)
            }
        }
    }
}

/// A microphone driven by the tokio clock
pub struct SimulatedInput {
    access: DeviceAccess,
    source: SignalSource,
    format: StreamFormat,
    chunk_period: Duration,
    permission_delay: Duration,
    fail_after_chunks: Option<usize>,
    tracks: TrackCounter,
    last_constraints: Option<CaptureConstraints>,
}

impl SimulatedInput {
    pub fn new() -> Self {
        Self {
            access: DeviceAccess::Granted,
            source: SignalSource::Voice(VoiceSignal::default()),
            format: StreamFormat::default(),
            chunk_period: DEFAULT_CHUNK_PERIOD,
            permission_delay: Duration::ZERO,
            fail_after_chunks: None,
            tracks: TrackCounter::default(),
            last_constraints: None,
        }
    }

    pub fn with_access(mut self, access: DeviceAccess) -> Self {
        self.access = access;
        self
    }

    pub fn with_source(mut self, source: SignalSource) -> Self {
        self.source = source;
        self
    }

    /// Default layout when the caller expresses no preference
    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    /// Time the permission prompt takes to be answered
    pub fn with_permission_delay(mut self, delay: Duration) -> Self {
        self.permission_delay = delay;
        self
    }

    /// Drop the stream with a failure after this many chunks
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    pub fn tracks(&self) -> TrackCounter {
        self.tracks.clone()
    }

    /// Hints passed to the most recent successful open
    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.last_constraints
    }

    fn negotiate(&self, constraints: &CaptureConstraints) -> StreamFormat {
        match &self.source {
            SignalSource::Clip(clip) => StreamFormat {
                sample_rate: clip.sample_rate(),
                channels: clip.channels(),
            },
            SignalSource::Voice(_) => StreamFormat {
                sample_rate: constraints
                    .sample_rate
                    .filter(|&rate| rate > 0)
                    .unwrap_or(self.format.sample_rate),
                channels: constraints
                    .channels
                    .filter(|&channels| channels > 0)
                    .unwrap_or(self.format.channels),
            },
        }
    }
}

impl Default for SimulatedInput {
    fn default() -> Self {
        Self::new()
    }
}

impl InputDevice for SimulatedInput {
    async fn open(
        &mut self,
        constraints: &CaptureConstraints,
        sink: CaptureSink,
    ) -> Result<Box<dyn InputStream>, DeviceError> {
        if !self.permission_delay.is_zero() {
            sleep(self.permission_delay).await;
        }

        match self.access {
            DeviceAccess::Granted => {}
            DeviceAccess::Denied => return Err(DeviceError::PermissionDenied),
            DeviceAccess::Absent => {
                return Err(DeviceError::Unavailable(
                    "no simulated input device".to_string(),
                ))
            }
        }

        self.last_constraints = Some(*constraints);
        let format = self.negotiate(constraints);
        let period_ms = self.chunk_period.as_millis().max(1) as u64;
        let frames_per_chunk = (format.sample_rate as u64 * period_ms / 1000).max(1) as usize;

        info!(
            "simulated input opened at {} (aec={}, ns={}, agc={})",
            format,
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let generator = Generator::new(&self.source, format);
        self.tracks.acquire();
        let task = tokio::spawn(run_input(
            generator,
            sink,
            self.chunk_period,
            frames_per_chunk,
            self.fail_after_chunks,
            stop_rx,
        ));

        Ok(Box::new(SimulatedInputStream {
            format,
            stop: Some(stop_tx),
            task: Some(task),
            tracks: self.tracks.clone(),
        }))
    }
}

async fn run_input(
    mut generator: Generator,
    sink: CaptureSink,
    period: Duration,
    frames_per_chunk: usize,
    fail_after: Option<usize>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut sent = 0usize;

    loop {
        tokio::select! {
            biased;
            requested = &mut stop_rx => {
                if requested.is_ok() {
                    debug!("simulated input flushed after {} chunks", sent);
                    sink.stopped();
                }
                return;
            }
            _ = ticker.tick() => {
                if fail_after == Some(sent) {
                    sink.failed("simulated input disconnected");
                    return;
                }
                match generator.next_chunk(frames_per_chunk) {
                    Some(samples) => {
                        if !sink.chunk(encode_raw_f32le(&samples)) {
                            return;
                        }
                        sent += 1;
                    }
                    None => {
                        debug!("simulated input source exhausted after {} chunks", sent);
                        sink.stopped();
                        return;
                    }
                }
            }
        }
    }
}

struct SimulatedInputStream {
    format: StreamFormat,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    tracks: TrackCounter,
}

impl InputStream for SimulatedInputStream {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn request_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    fn release(&mut self) {
        self.stop = None;
        if let Some(task) = self.task.take() {
            task.abort();
            self.tracks.release();
            debug!("simulated input released");
        }
    }

    fn is_live(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for SimulatedInputStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// A speaker that plays in wall-clock time without making a sound
#[derive(Default)]
pub struct SimulatedOutput {
    failure: Option<String>,
    drop_after: Option<Duration>,
    tracks: TrackCounter,
}

impl SimulatedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every start fails with this device error
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Streams die this long after starting, unless the clip is shorter
    pub fn dropping_after(mut self, after: Duration) -> Self {
        self.drop_after = Some(after);
        self
    }

    pub fn tracks(&self) -> TrackCounter {
        self.tracks.clone()
    }
}

impl OutputDevice for SimulatedOutput {
    fn start(
        &mut self,
        clip: Arc<AudioClip>,
        ended: PlaybackEndSink,
    ) -> Result<Box<dyn OutputStream>, PlaybackError> {
        if let Some(reason) = &self.failure {
            return Err(PlaybackError::Device(reason.clone()));
        }

        let playhead = Arc::new(ClockPlayhead {
            started: Instant::now(),
            sample_rate: clip.sample_rate(),
            frames: clip.frames(),
        });
        let duration = clip.duration();
        let drop_after = self.drop_after.filter(|&after| after < duration);
        self.tracks.acquire();
        debug!(
            "simulated output stream {} started ({:.2}s)",
            ended.stream_id(),
            duration.as_secs_f64()
        );

        let task = tokio::spawn(async move {
            match drop_after {
                Some(after) => {
                    sleep(after).await;
                    ended.failed("simulated output disconnected");
                }
                None => {
                    sleep(duration).await;
                    ended.ended();
                }
            }
        });

        Ok(Box::new(SimulatedPlayback {
            playhead,
            task: Some(task),
            tracks: self.tracks.clone(),
        }))
    }
}

struct ClockPlayhead {
    started: Instant,
    sample_rate: u32,
    frames: usize,
}

impl Playhead for ClockPlayhead {
    fn position(&self) -> usize {
        let elapsed = self.started.elapsed().as_secs_f64();
        ((elapsed * self.sample_rate as f64) as usize).min(self.frames)
    }
}

struct SimulatedPlayback {
    playhead: Arc<ClockPlayhead>,
    task: Option<JoinHandle<()>>,
    tracks: TrackCounter,
}

impl OutputStream for SimulatedPlayback {
    fn playhead(&self) -> Arc<dyn Playhead> {
        self.playhead.clone()
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.tracks.release();
        }
    }
}

impl Drop for SimulatedPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{CaptureEvent, SessionEvent};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    async fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> (usize, CaptureEvent) {
        let mut chunks = 0;
        loop {
            match rx.recv().await {
                Some(SessionEvent::Capture {
                    event: CaptureEvent::Chunk(_),
                    ..
                }) => chunks += 1,
                Some(SessionEvent::Capture { event, .. }) => return (chunks, event),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_and_missing_devices() {
        let (tx, _rx) = unbounded_channel();
        let mut denied = SimulatedInput::new().with_access(DeviceAccess::Denied);
        let result = denied
            .open(&CaptureConstraints::default(), CaptureSink::new(1, tx.clone()))
            .await;
        assert_eq!(result.err(), Some(DeviceError::PermissionDenied));

        let mut absent = SimulatedInput::new().with_access(DeviceAccess::Absent);
        let result = absent
            .open(&CaptureConstraints::default(), CaptureSink::new(1, tx))
            .await;
        assert!(matches!(result.err(), Some(DeviceError::Unavailable(_))));
        assert_eq!(absent.tracks().get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_streams_until_stopped() {
        let (tx, mut rx) = unbounded_channel();
        let mut input = SimulatedInput::new();
        let tracks = input.tracks();
        let constraints = CaptureConstraints {
            sample_rate: Some(16000),
            ..Default::default()
        };
        let mut stream = input
            .open(&constraints, CaptureSink::new(4, tx))
            .await
            .unwrap();

        assert_eq!(stream.format().sample_rate, 16000);
        assert_eq!(input.last_constraints(), Some(constraints));
        assert_eq!(tracks.get(), 1);

        sleep(Duration::from_millis(110)).await;
        stream.request_stop();
        let (chunks, last) = drain(&mut rx).await;
        assert_eq!(chunks, 5);
        assert_eq!(last, CaptureEvent::Stopped);

        assert!(stream.is_live());
        stream.release();
        stream.release();
        assert!(!stream.is_live());
        assert_eq!(tracks.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_default_format_without_constraints() {
        let (tx, _rx) = unbounded_channel();
        let preferred = StreamFormat {
            sample_rate: 22050,
            channels: 2,
        };
        let mut input = SimulatedInput::new().with_format(preferred);

        let stream = input
            .open(&CaptureConstraints::default(), CaptureSink::new(1, tx.clone()))
            .await
            .unwrap();
        assert_eq!(stream.format(), preferred);

        let mono = CaptureConstraints {
            channels: Some(1),
            ..Default::default()
        };
        let stream = input.open(&mono, CaptureSink::new(2, tx)).await.unwrap();
        assert_eq!(
            stream.format(),
            StreamFormat {
                sample_rate: 22050,
                channels: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_clip_ends_the_stream() {
        let clip = Arc::new(AudioClip::new(8000, 1, vec![0.25; 400]).unwrap());
        let (tx, mut rx) = unbounded_channel();
        let mut input = SimulatedInput::new().with_source(SignalSource::Clip(clip));
        let _stream = input
            .open(&CaptureConstraints::default(), CaptureSink::new(1, tx))
            .await
            .unwrap();

        // 160 frames per 20 ms chunk
        let (chunks, last) = drain(&mut rx).await;
        assert_eq!(chunks, 3);
        assert_eq!(last, CaptureEvent::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_reported() {
        let (tx, mut rx) = unbounded_channel();
        let mut input = SimulatedInput::new().failing_after(2);
        let _stream = input
            .open(&CaptureConstraints::default(), CaptureSink::new(1, tx))
            .await
            .unwrap();
        let (chunks, last) = drain(&mut rx).await;
        assert_eq!(chunks, 2);
        assert!(matches!(last, CaptureEvent::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_ends_after_clip_duration() {
        let (tx, mut rx) = unbounded_channel();
        let clip = Arc::new(AudioClip::new(1000, 1, vec![0.0; 500]).unwrap());
        let mut output = SimulatedOutput::new();
        let stream = output.start(clip, PlaybackEndSink::new(9, tx)).unwrap();
        let playhead = stream.playhead();
        assert_eq!(output.tracks().get(), 1);

        sleep(Duration::from_millis(250)).await;
        assert_eq!(playhead.position(), 250);

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::PlaybackEnded { stream_id: 9 })
        ));
        assert_eq!(playhead.position(), 500);
        drop(stream);
        assert_eq!(output.tracks().get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_dies_mid_clip() {
        let (tx, mut rx) = unbounded_channel();
        let mut output = SimulatedOutput::new().dropping_after(Duration::from_millis(100));

        let long = Arc::new(AudioClip::new(1000, 1, vec![0.0; 500]).unwrap());
        let _stream = output.start(long, PlaybackEndSink::new(2, tx.clone())).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::PlaybackFailed { stream_id: 2, .. })
        ));

        // a clip shorter than the drop point still plays out
        let short = Arc::new(AudioClip::new(1000, 1, vec![0.0; 50]).unwrap());
        let _stream = output.start(short, PlaybackEndSink::new(3, tx)).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::PlaybackEnded { stream_id: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_output_starts_nothing() {
        let (tx, _rx) = unbounded_channel();
        let clip = Arc::new(AudioClip::new(1000, 1, vec![0.0; 10]).unwrap());
        let mut output = SimulatedOutput::new().failing("unplugged");
        let result = output.start(clip, PlaybackEndSink::new(1, tx));
        assert_eq!(
            result.err().map(|e| e.to_string()),
            Some("output device failed: unplugged".to_string())
        );
        assert_eq!(output.tracks().get(), 0);
    }
}
