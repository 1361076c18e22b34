//! Live spectrum bars for whichever channel is playing
//!
//! A repeating tick reads the playhead, analyses the most recent window of
//! the playing clip and publishes a [`VisualizationFrame`]. Frequency bands
//! are spaced geometrically so low frequencies get more bars.

use crate::audio::Playhead;
use crate::dsp::stft::{half_magnitudes, AnalysisConfig, Stft, WindowKind};
use crate::error::ProcessingError;
use crate::models::{mixdown_range, AudioClip, PlaybackChannel};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Magnitudes below this are treated as silence
const MAGNITUDE_FLOOR: f32 = 1e-10;

/// Renderer tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    /// Target tick rate
    pub fps: u32,
    /// Analysis window in frames, a power of two
    pub window: usize,
    pub bar_count: usize,
    /// Dynamic range mapped onto `[0, 1]`
    pub range_db: f32,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            window: 1024,
            bar_count: 32,
            range_db: 90.0,
        }
    }
}

impl VisualConfig {
    pub fn validate(&self) -> Result<(), ProcessingError> {
        if self.fps == 0 || self.fps > 1000 {
            return Err(ProcessingError::InvalidParameter(format!(
                "visual tick rate {} fps must be between 1 and 1000",
                self.fps
            )));
        }
        if self.bar_count == 0 || self.bar_count > self.window / 2 {
            return Err(ProcessingError::InvalidParameter(format!(
                "{} bars do not fit a {}-frame window",
                self.bar_count, self.window
            )));
        }
        if !self.range_db.is_finite() || self.range_db <= 0.0 {
            return Err(ProcessingError::InvalidParameter(format!(
                "visual range {} dB must be positive",
                self.range_db
            )));
        }
        self.analysis().validate()
    }

    fn analysis(&self) -> AnalysisConfig {
        AnalysisConfig {
            fft_size: self.window,
            hop_size: (self.window / 2).max(1),
            window: WindowKind::Hann,
        }
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

/// One rendered frame
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationFrame {
    pub channel: PlaybackChannel,
    /// Playhead position the frame was computed at, in sample frames
    pub position: usize,
    /// Band heights in `[0, 1]`, lowest frequency first
    pub bars: Vec<f32>,
    /// RMS of the analysed window
    pub level: f32,
    /// Counts up from 1 for each playback
    pub sequence: u64,
}

/// Turns a window of audio into bar heights
#[derive(Clone)]
pub struct SpectrumAnalyzer {
    stft: Stft,
    bands: Vec<(usize, usize)>,
    range_db: f32,
    /// Maps FFT magnitude back to sine amplitude
    amplitude_scale: f32,
}

impl SpectrumAnalyzer {
    pub fn new(config: &VisualConfig) -> Result<Self, ProcessingError> {
        config.validate()?;
        let stft = Stft::new(config.analysis())?;
        let bins = config.window / 2 + 1;

        // geometric band edges from bin 1 up to Nyquist, skipping DC
        let usable = (bins - 1) as f32;
        let edge = |i: usize| {
            let pos = i as f32 / config.bar_count as f32;
            usable.powf(pos) as usize
        };
        let bands = (0..config.bar_count)
            .map(|i| {
                let lo = edge(i).clamp(1, bins - 1);
                let hi = edge(i + 1).clamp(lo + 1, bins);
                (lo, hi)
            })
            .collect();

        let window_sum: f32 = stft.window().iter().sum();
        let amplitude_scale = 2.0 * (config.window as f32).sqrt() / window_sum;

        Ok(Self {
            stft,
            bands,
            range_db: config.range_db,
            amplitude_scale,
        })
    }

    /// Bars and RMS level for the window ending at `position`
    pub fn analyze(&mut self, clip: &AudioClip, position: usize) -> (Vec<f32>, f32) {
        let n = self.stft.config().fft_size;
        let end = position.min(clip.frames());
        let mono = mixdown_range(clip, end.saturating_sub(n), end);

        let level = if mono.is_empty() {
            0.0
        } else {
            (mono.iter().map(|s| s * s).sum::<f32>() / mono.len() as f32).sqrt()
        };

        let mut spectrum = Vec::with_capacity(n);
        self.stft.forward(&mono, &mut spectrum);
        let magnitudes = half_magnitudes(&spectrum);

        let bars = self
            .bands
            .iter()
            .map(|&(lo, hi)| {
                let peak = magnitudes[lo..hi].iter().copied().fold(0.0f32, f32::max);
                let amplitude = (peak * self.amplitude_scale).max(MAGNITUDE_FLOOR);
                let db = 20.0 * amplitude.log10();
                ((db + self.range_db) / self.range_db).clamp(0.0, 1.0)
            })
            .collect();

        (bars, level)
    }
}

#[derive(Default)]
struct FrameSlot {
    /// Bumped by every stop; a tick only publishes for the epoch it was started in
    epoch: u64,
    latest: Option<VisualizationFrame>,
    rendered: u64,
}

fn lock(slot: &Mutex<FrameSlot>) -> MutexGuard<'_, FrameSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives the render tick and holds the latest frame
pub struct VisualizationRenderer {
    config: VisualConfig,
    analyzer: SpectrumAnalyzer,
    slot: Arc<Mutex<FrameSlot>>,
    task: Option<JoinHandle<()>>,
}

impl VisualizationRenderer {
    pub fn new(config: VisualConfig) -> Result<Self, ProcessingError> {
        Ok(Self {
            analyzer: SpectrumAnalyzer::new(&config)?,
            config,
            slot: Arc::new(Mutex::new(FrameSlot::default())),
            task: None,
        })
    }

    pub fn config(&self) -> &VisualConfig {
        &self.config
    }

    /// Start ticking for `channel`, replacing any running tick
    pub fn start(
        &mut self,
        channel: PlaybackChannel,
        clip: Arc<AudioClip>,
        playhead: Arc<dyn Playhead>,
    ) {
        self.stop();
        let epoch = lock(&self.slot).epoch;

        let slot = Arc::downgrade(&self.slot);
        let analyzer = self.analyzer.clone();
        let period = self.config.period();
        self.task = Some(tokio::spawn(run_ticks(
            slot, epoch, analyzer, period, channel, clip, playhead,
        )));
        debug!("visualisation started for {}", channel);
    }

    /// Stop ticking; no frame is published once this returns
    pub fn stop(&mut self) {
        {
            let mut slot = lock(&self.slot);
            slot.epoch += 1;
            slot.latest = None;
        }
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("visualisation stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    pub fn latest_frame(&self) -> Option<VisualizationFrame> {
        lock(&self.slot).latest.clone()
    }

    /// Frames published since construction
    pub fn frames_rendered(&self) -> u64 {
        lock(&self.slot).rendered
    }
}

impl Drop for VisualizationRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticks(
    slot: Weak<Mutex<FrameSlot>>,
    epoch: u64,
    mut analyzer: SpectrumAnalyzer,
    period: Duration,
    channel: PlaybackChannel,
    clip: Arc<AudioClip>,
    playhead: Arc<dyn Playhead>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence = 0u64;

    loop {
        ticker.tick().await;
        let Some(slot) = slot.upgrade() else {
            return;
        };

        let position = playhead.position();
        let (bars, level) = analyzer.analyze(&clip, position);

        let mut guard = lock(&slot);
        // a tick already past the abort point must not outlive its stop
        if guard.epoch != epoch {
            return;
        }
        sequence += 1;
        guard.rendered += 1;
        guard.latest = Some(VisualizationFrame {
            channel,
            position,
            bars,
            level,
            sequence,
        });
    }
}
