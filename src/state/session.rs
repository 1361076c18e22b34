//! The record → denoise → compare state machine
//!
//! A [`ComparisonSession`] owns every device handle, clip and timer the
//! pipeline acquires. Devices and workers never touch it directly: they
//! post [`SessionEvent`]s which the session applies one at a time from
//! [`ComparisonSession::step`]. Each event carries the generation it was
//! produced for, and every reset or failure starts a new generation, so
//! late results from an abandoned run are dropped instead of applied.

use crate::audio::{
    CaptureConstraints, CaptureController, InputDevice, InputLevel, OutputDevice, PlayOutcome,
    PlaybackCoordinator, SessionEvent,
};
use crate::dsp::{self, AnalysisConfig, GateParams, NoiseProfile, DEFAULT_PROFILE_WINDOW_MS};
use crate::error::{ErrorKind, PlaybackError, ProcessingError, SessionError};
use crate::models::{AudioClip, Phase, PlaybackChannel, ProcessedClip};
use crate::visual::{VisualConfig, VisualizationFrame, VisualizationRenderer};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Everything a session needs to know up front
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub constraints: CaptureConstraints,
    /// Recording auto-stops after this long
    pub max_duration: Duration,
    pub analysis: AnalysisConfig,
    /// Leading segment used for the noise estimate
    pub profile_window_ms: u32,
    pub gate: GateParams,
    pub visual: VisualConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            constraints: CaptureConstraints::default(),
            max_duration: crate::audio::capture::DEFAULT_MAX_DURATION,
            analysis: AnalysisConfig::default(),
            profile_window_ms: DEFAULT_PROFILE_WINDOW_MS,
            gate: GateParams::default(),
            visual: VisualConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ProcessingError> {
        if self.max_duration.is_zero() {
            return Err(ProcessingError::InvalidParameter(
                "recording cap must be longer than zero".to_string(),
            ));
        }
        self.analysis.validate()?;
        self.gate.validate()?;
        self.visual.validate()
    }
}

/// What a session is holding at a given moment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub recording: bool,
    pub input_device: bool,
    pub playback: bool,
    pub loaded_clips: usize,
    pub visual_tick: bool,
    pub original: bool,
    pub processed: bool,
    pub processing: bool,
}

impl ResourceSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Single owner of one capture/compare lifecycle
pub struct ComparisonSession<I: InputDevice, O: OutputDevice> {
    config: SessionConfig,
    input: I,
    capture: CaptureController,
    playback: PlaybackCoordinator<O>,
    renderer: VisualizationRenderer,
    phase: Phase,
    generation: u64,
    last_error: Option<SessionError>,
    original: Option<Arc<AudioClip>>,
    processed: Option<ProcessedClip>,
    processing: Option<u64>,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
    phase_tx: broadcast::Sender<Phase>,
}

impl<I: InputDevice, O: OutputDevice> ComparisonSession<I, O> {
    pub fn new(input: I, output: O, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;

        let (events_tx, events_rx) = unbounded_channel();
        let (phase_tx, _) = broadcast::channel(32);
        let renderer = VisualizationRenderer::new(config.visual)?;

        Ok(Self {
            capture: CaptureController::new(config.constraints, config.max_duration),
            playback: PlaybackCoordinator::new(output, events_tx.clone()),
            renderer,
            input,
            config,
            phase: Phase::Idle,
            generation: 0,
            last_error: None,
            original: None,
            processed: None,
            processing: None,
            events_tx,
            events_rx,
            phase_tx,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Kind of the failure that put the session in [`Phase::Error`]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.phase {
            Phase::Error => self.last_error.as_ref().and_then(SessionError::kind),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn original(&self) -> Option<&Arc<AudioClip>> {
        self.original.as_ref()
    }

    pub fn processed(&self) -> Option<&ProcessedClip> {
        self.processed.as_ref()
    }

    pub fn profile(&self) -> Option<&Arc<NoiseProfile>> {
        self.processed.as_ref().map(ProcessedClip::profile)
    }

    pub fn active_channel(&self) -> Option<PlaybackChannel> {
        self.playback.active_channel()
    }

    pub fn latest_frame(&self) -> Option<VisualizationFrame> {
        self.renderer.latest_frame()
    }

    /// Input level while recording
    pub fn input_level(&self) -> InputLevel {
        self.capture.level()
    }

    /// Audio captured so far in the current recording
    pub fn recorded(&self) -> Duration {
        self.capture
            .session()
            .map(|s| s.buffered())
            .unwrap_or_default()
    }

    /// Output device, for inspection
    pub fn output(&self) -> &O {
        self.playback.device()
    }

    pub fn resources(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            recording: self.capture.session().is_some(),
            input_device: self.capture.is_holding_device(),
            playback: self.playback.active_channel().is_some(),
            loaded_clips: self.playback.loaded_count(),
            visual_tick: self.renderer.is_active(),
            original: self.original.is_some(),
            processed: self.processed.is_some(),
            processing: self.processing.is_some(),
        }
    }

    /// Receive every phase the session enters from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Open the input device and start recording
    ///
    /// Only valid from [`Phase::Idle`]. A refused or missing device moves
    /// the session to [`Phase::Error`].
    pub async fn start_capture(&mut self) -> Result<(), SessionError> {
        self.expect_phase("start capture", &[Phase::Idle])?;

        let generation = self.generation;
        let result = self
            .capture
            .start(&mut self.input, generation, self.events_tx.clone())
            .await;

        match result {
            Ok(()) => {
                self.set_phase(Phase::Recording);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stop recording early
    ///
    /// The clip is produced once the device has flushed, on a later
    /// [`step`](Self::step). Calling this again before that is a no-op.
    pub fn stop_capture(&mut self) -> Result<(), SessionError> {
        self.expect_phase("stop capture", &[Phase::Recording])?;
        if self.capture.request_stop() {
            info!("recording stopped by caller");
        }
        Ok(())
    }

    /// Toggle playback of `channel`
    ///
    /// Fails without side effects when the channel has nothing loaded yet.
    /// An output device failure moves the session to [`Phase::Error`].
    pub fn play(&mut self, channel: PlaybackChannel) -> Result<PlayOutcome, SessionError> {
        match self.playback.play(channel) {
            Ok(PlayOutcome::Started) => {
                if let Some((channel, clip, playhead)) = self.playback.active_view() {
                    self.renderer.start(channel, clip, playhead);
                }
                Ok(PlayOutcome::Started)
            }
            Ok(PlayOutcome::Stopped) => {
                self.renderer.stop();
                Ok(PlayOutcome::Stopped)
            }
            Err(e @ PlaybackError::Unavailable(_)) => Err(SessionError::Playback(e)),
            Err(e) => {
                self.renderer.stop();
                Err(self.fail(SessionError::Playback(e)))
            }
        }
    }

    /// Stop `channel` if it is playing
    pub fn stop(&mut self, channel: PlaybackChannel) {
        if self.playback.stop(channel) {
            self.renderer.stop();
        }
    }

    /// Drop everything and return to [`Phase::Idle`]
    ///
    /// Processing already running is left to finish; its result is
    /// discarded.
    pub fn reset(&mut self) {
        let from = self.phase;
        self.release_all();
        self.last_error = None;

        // anything still queued belongs to the abandoned generation
        while self.events_rx.try_recv().is_ok() {}

        info!("session reset from {}", from);
        self.set_phase(Phase::Idle);
    }

    /// Wait for the next event and apply it
    pub async fn step(&mut self) -> Phase {
        if let Some(event) = self.events_rx.recv().await {
            self.apply(event);
        }
        self.phase
    }

    /// Step until the session is no longer recording or processing
    pub async fn run_until_settled(&mut self) -> Phase {
        while self.phase.is_transient() {
            self.step().await;
        }
        self.phase
    }

    /// Step until nothing is playing
    pub async fn run_until_playback_idle(&mut self) {
        while self.playback.active_channel().is_some() {
            self.step().await;
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Capture { generation, event } => {
                if generation != self.generation {
                    return;
                }
                match self.capture.on_event(generation, event) {
                    Some(Ok(clip)) => self.on_captured(clip),
                    Some(Err(e)) => {
                        self.fail(e);
                    }
                    None => {}
                }
            }
            SessionEvent::CaptureDeadline { generation } => {
                if generation == self.generation
                    && self.phase == Phase::Recording
                    && self.capture.request_stop()
                {
                    info!(
                        "recording reached its {} ms cap",
                        self.config.max_duration.as_millis()
                    );
                }
            }
            SessionEvent::ProcessingDone { generation, result } => {
                if generation != self.generation || self.processing != Some(generation) {
                    warn!("discarding processing result from generation {}", generation);
                    return;
                }
                self.processing = None;
                match result {
                    Ok(processed) => self.on_processed(processed),
                    Err(e) => {
                        self.fail(e);
                    }
                }
            }
            SessionEvent::PlaybackEnded { stream_id } => {
                if self.playback.on_ended(stream_id).is_some() {
                    self.renderer.stop();
                }
            }
            SessionEvent::PlaybackFailed { stream_id, reason } => {
                if let Some(e) = self.playback.on_failed(stream_id, &reason) {
                    self.fail(SessionError::Playback(e));
                }
            }
        }
    }

    fn on_captured(&mut self, clip: AudioClip) {
        let clip = Arc::new(clip);
        self.original = Some(clip.clone());
        self.set_phase(Phase::Captured);
        self.start_processing(clip);
    }

    fn start_processing(&mut self, clip: Arc<AudioClip>) {
        let generation = self.generation;
        let analysis = self.config.analysis;
        let window_ms = self.config.profile_window_ms;
        let params = self.config.gate;

        let worker = tokio::task::spawn_blocking(move || {
            dsp::reduce_noise(clip, analysis, window_ms, &params)
        });

        // report exactly once, even if the worker panics
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(result) => result.map_err(SessionError::from),
                Err(e) => Err(ProcessingError::WorkerFailed(e.to_string()).into()),
            };
            let _ = events.send(SessionEvent::ProcessingDone { generation, result });
        });

        self.processing = Some(generation);
        self.set_phase(Phase::Processing);
    }

    fn on_processed(&mut self, processed: ProcessedClip) {
        debug!(
            "noise profile from {} frames, mean magnitude {:.6}",
            processed.profile().frame_count(),
            processed.profile().mean_magnitude()
        );

        self.playback
            .load(PlaybackChannel::Original, processed.source().clone());
        self.playback
            .load(PlaybackChannel::Processed, Arc::new(processed.clip().clone()));
        self.processed = Some(processed);
        self.set_phase(Phase::Ready);
    }

    /// Release everything and enter [`Phase::Error`]
    fn fail(&mut self, err: SessionError) -> SessionError {
        match err.kind() {
            Some(kind) => error!("{} while {}: {}", kind, self.phase, err),
            None => error!("session failed while {}: {}", self.phase, err),
        }
        self.release_all();
        self.last_error = Some(err.clone());
        self.set_phase(Phase::Error);
        err
    }

    fn release_all(&mut self) {
        self.generation += 1;
        self.capture.abort();
        self.renderer.stop();
        self.playback.unload_all();
        self.original = None;
        self.processed = None;
        self.processing = None;
    }

    fn expect_phase(&self, action: &'static str, allowed: &[Phase]) -> Result<(), SessionError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SessionError::InvalidPhase {
                action,
                phase: self.phase,
            })
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("phase {} -> {}", self.phase, phase);
        }
        self.phase = phase;
        let _ = self.phase_tx.send(phase);
    }
}
