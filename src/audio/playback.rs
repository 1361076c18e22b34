//! A/B playback of the original and processed clips
//!
//! At most one channel is audible at a time. Playing the active channel
//! again stops it, and playing the other one stops the active stream
//! first. Every start plays from the beginning.

use super::device::{OutputDevice, OutputStream, PlaybackEndSink, Playhead, SessionEvent};
use crate::error::PlaybackError;
use crate::models::{AudioClip, PlaybackChannel};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// What a call to [`PlaybackCoordinator::play`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// The channel was already playing and has been stopped
    Stopped,
}

struct ActiveStream {
    channel: PlaybackChannel,
    stream_id: u64,
    stream: Box<dyn OutputStream>,
    clip: Arc<AudioClip>,
}

/// Owns the output device and the clips loaded for each channel
pub struct PlaybackCoordinator<O: OutputDevice> {
    device: O,
    clips: [Option<Arc<AudioClip>>; 2],
    active: Option<ActiveStream>,
    next_stream_id: u64,
    events: UnboundedSender<SessionEvent>,
}

impl<O: OutputDevice> PlaybackCoordinator<O> {
    pub fn new(device: O, events: UnboundedSender<SessionEvent>) -> Self {
        Self {
            device,
            clips: [None, None],
            active: None,
            next_stream_id: 1,
            events,
        }
    }

    pub fn device(&self) -> &O {
        &self.device
    }

    /// Make a clip available on `channel`, replacing any previous one
    pub fn load(&mut self, channel: PlaybackChannel, clip: Arc<AudioClip>) {
        if self.active_channel() == Some(channel) {
            self.stop_all();
        }
        self.clips[channel.index()] = Some(clip);
    }

    /// Stop playback and forget both clips
    pub fn unload_all(&mut self) {
        self.stop_all();
        self.clips = [None, None];
    }

    pub fn is_loaded(&self, channel: PlaybackChannel) -> bool {
        self.clips[channel.index()].is_some()
    }

    /// Number of clips currently held
    pub fn loaded_count(&self) -> usize {
        self.clips.iter().filter(|c| c.is_some()).count()
    }

    pub fn active_channel(&self) -> Option<PlaybackChannel> {
        self.active.as_ref().map(|a| a.channel)
    }

    pub fn is_playing(&self, channel: PlaybackChannel) -> bool {
        self.active_channel() == Some(channel)
    }

    /// The playing clip and where its playhead is
    pub fn active_view(&self) -> Option<(PlaybackChannel, Arc<AudioClip>, Arc<dyn Playhead>)> {
        self.active
            .as_ref()
            .map(|a| (a.channel, a.clip.clone(), a.stream.playhead()))
    }

    /// Toggle `channel`
    ///
    /// An unloaded channel is an error and changes nothing.
    pub fn play(&mut self, channel: PlaybackChannel) -> Result<PlayOutcome, PlaybackError> {
        let clip = self.clips[channel.index()]
            .clone()
            .ok_or(PlaybackError::Unavailable(channel))?;

        if let Some(active) = self.active_channel() {
            self.stop_all();
            if active == channel {
                return Ok(PlayOutcome::Stopped);
            }
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        let ended = PlaybackEndSink::new(stream_id, self.events.clone());
        let stream = self.device.start(clip.clone(), ended)?;

        info!(
            "playing {} ({:.2}s, stream {})",
            channel,
            clip.duration_seconds(),
            stream_id
        );
        self.active = Some(ActiveStream {
            channel,
            stream_id,
            stream,
            clip,
        });
        Ok(PlayOutcome::Started)
    }

    /// Stop `channel` if it is the one playing; returns whether it was
    pub fn stop(&mut self, channel: PlaybackChannel) -> bool {
        if self.is_playing(channel) {
            self.stop_all();
            true
        } else {
            false
        }
    }

    pub fn stop_all(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stream.stop();
            debug!("stopped {} (stream {})", active.channel, active.stream_id);
        }
    }

    /// Handle an end-of-clip notification
    ///
    /// Returns the channel that finished, or `None` when the notification
    /// belongs to a stream that was already stopped or replaced.
    pub fn on_ended(&mut self, stream_id: u64) -> Option<PlaybackChannel> {
        let channel = self.finish(stream_id)?;
        info!("{} playback finished", channel);
        Some(channel)
    }

    /// Handle a stream that died mid-clip
    ///
    /// Stale notifications are ignored like in [`on_ended`](Self::on_ended).
    pub fn on_failed(&mut self, stream_id: u64, reason: &str) -> Option<PlaybackError> {
        let channel = self.finish(stream_id)?;
        warn!("{} playback failed: {}", channel, reason);
        Some(PlaybackError::Device(reason.to_string()))
    }

    fn finish(&mut self, stream_id: u64) -> Option<PlaybackChannel> {
        match &self.active {
            Some(active) if active.stream_id == stream_id => {
                let channel = active.channel;
                self.stop_all();
                Some(channel)
            }
            _ => {
                debug!("ignoring notification from stale stream {}", stream_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::SimulatedOutput;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn clip(ms: usize) -> Arc<AudioClip> {
        Arc::new(AudioClip::new(1000, 1, vec![0.1; ms]).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_channel_has_no_side_effect() {
        let (tx, _rx) = unbounded_channel();
        let mut coordinator = PlaybackCoordinator::new(SimulatedOutput::new(), tx);
        coordinator.load(PlaybackChannel::Original, clip(100));
        assert!(coordinator.is_loaded(PlaybackChannel::Original));
        assert!(!coordinator.is_loaded(PlaybackChannel::Processed));
        coordinator.play(PlaybackChannel::Original).unwrap();

        let err = coordinator.play(PlaybackChannel::Processed).unwrap_err();
        assert_eq!(err, PlaybackError::Unavailable(PlaybackChannel::Processed));
        assert!(coordinator.is_playing(PlaybackChannel::Original));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_are_mutually_exclusive() {
        let (tx, _rx) = unbounded_channel();
        let output = SimulatedOutput::new();
        let tracks = output.tracks();
        let mut coordinator = PlaybackCoordinator::new(output, tx);
        coordinator.load(PlaybackChannel::Original, clip(1000));
        coordinator.load(PlaybackChannel::Processed, clip(1000));

        coordinator.play(PlaybackChannel::Original).unwrap();
        assert_eq!(
            coordinator.play(PlaybackChannel::Processed).unwrap(),
            PlayOutcome::Started
        );
        assert!(!coordinator.is_playing(PlaybackChannel::Original));
        assert!(coordinator.is_playing(PlaybackChannel::Processed));
        assert_eq!(tracks.get(), 1);

        assert_eq!(
            coordinator.play(PlaybackChannel::Processed).unwrap(),
            PlayOutcome::Stopped
        );
        assert_eq!(coordinator.active_channel(), None);
        assert_eq!(tracks.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_starts_from_the_beginning() {
        let (tx, _rx) = unbounded_channel();
        let mut coordinator = PlaybackCoordinator::new(SimulatedOutput::new(), tx);
        coordinator.load(PlaybackChannel::Original, clip(1000));

        coordinator.play(PlaybackChannel::Original).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let (_, _, playhead) = coordinator.active_view().unwrap();
        assert_eq!(playhead.position(), 400);

        assert!(coordinator.stop(PlaybackChannel::Original));
        assert!(!coordinator.stop(PlaybackChannel::Original));
        coordinator.play(PlaybackChannel::Original).unwrap();
        let (_, _, playhead) = coordinator.active_view().unwrap();
        assert_eq!(playhead.position(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_end_events_are_ignored() {
        let (tx, mut rx) = unbounded_channel();
        let mut coordinator = PlaybackCoordinator::new(SimulatedOutput::new(), tx);
        coordinator.load(PlaybackChannel::Original, clip(50));
        coordinator.load(PlaybackChannel::Processed, clip(500));

        coordinator.play(PlaybackChannel::Original).unwrap();
        // the first stream is replaced before its end notification is handled
        tokio::time::sleep(Duration::from_millis(60)).await;
        coordinator.play(PlaybackChannel::Processed).unwrap();

        let Some(SessionEvent::PlaybackEnded { stream_id }) = rx.recv().await else {
            panic!("expected an end event");
        };
        assert_eq!(stream_id, 1);
        assert_eq!(coordinator.on_ended(stream_id), None);
        assert!(coordinator.is_playing(PlaybackChannel::Processed));

        let Some(SessionEvent::PlaybackEnded { stream_id }) = rx.recv().await else {
            panic!("expected an end event");
        };
        assert_eq!(coordinator.on_ended(stream_id), Some(PlaybackChannel::Processed));
        assert_eq!(coordinator.active_channel(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure_leaves_nothing_active() {
        let (tx, _rx) = unbounded_channel();
        let mut coordinator =
            PlaybackCoordinator::new(SimulatedOutput::new().failing("no sink"), tx);
        coordinator.load(PlaybackChannel::Original, clip(10));
        assert!(matches!(
            coordinator.play(PlaybackChannel::Original),
            Err(PlaybackError::Device(_))
        ));
        assert_eq!(coordinator.active_channel(), None);

        coordinator.unload_all();
        assert_eq!(coordinator.loaded_count(), 0);
    }
}
