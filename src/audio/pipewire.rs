//! Real microphone and speaker access through PipeWire
//!
//! Each stream runs its own PipeWire main loop on a dedicated thread and
//! reports through the session's event channel. Voice-processing hints
//! are expressed as the `Communication` media role, which lets the
//! session manager insert its echo-cancel and noise filters.

use super::device::{
    CaptureConstraints, CaptureSink, InputDevice, InputStream, OutputDevice, OutputStream,
    PlaybackEndSink, Playhead, StreamFormat,
};
use crate::error::{DeviceError, PlaybackError};
use crate::models::AudioClip;
use log::{debug, error, info};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

const APP_NAME: &str = "voxgate";

enum Command {
    Stop,
}

/// Build the EnumFormat pod asking for interleaved F32LE
fn format_pod(format: StreamFormat) -> Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(format.sample_rate);
    audio_info.set_channels(format.channels as u32);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    Ok(spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner())
}

/// Parse a Format param into the negotiated layout, if it is raw audio
fn parse_format(param: &Pod) -> Option<StreamFormat> {
    let (media_type, media_subtype) = format_utils::parse_format(param).ok()?;
    if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
        return None;
    }
    let mut info = spa::param::audio::AudioInfoRaw::new();
    info.parse(param).ok()?;
    Some(StreamFormat {
        sample_rate: info.rate(),
        channels: info.channels().max(1) as u16,
    })
}

/// Default PipeWire source
pub struct PipeWireInput {
    format: StreamFormat,
}

impl PipeWireInput {
    pub fn new() -> Self {
        Self {
            format: StreamFormat::default(),
        }
    }
}

impl Default for PipeWireInput {
    fn default() -> Self {
        Self::new()
    }
}

impl InputDevice for PipeWireInput {
    async fn open(
        &mut self,
        constraints: &CaptureConstraints,
        sink: CaptureSink,
    ) -> Result<Box<dyn InputStream>, DeviceError> {
        let format = StreamFormat {
            sample_rate: constraints.sample_rate.unwrap_or(self.format.sample_rate),
            channels: constraints.channels.unwrap_or(self.format.channels),
        };
        let role = if constraints.echo_cancellation
            || constraints.noise_suppression
            || constraints.auto_gain_control
        {
            "Communication"
        } else {
            "Production"
        };

        let (sender, receiver) = pw::channel::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = thread::spawn(move || {
            let mut ready = Some(ready_tx);
            let result = run_capture_loop(format, role, sink.clone(), receiver, &mut ready);
            if let Some(ready) = ready.take() {
                // never got as far as connecting
                let reason = result
                    .err()
                    .unwrap_or_else(|| "capture loop exited during setup".to_string());
                let _ = ready.send(Err(reason));
                return;
            }
            match result {
                Ok(()) => {
                    sink.stopped();
                }
                Err(e) => {
                    error!("PipeWire capture failed: {}", e);
                    sink.failed(e);
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(DeviceError::Unavailable(e));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(DeviceError::Unavailable(
                    "capture thread exited during setup".to_string(),
                ));
            }
        }

        info!("PipeWire capture connected at {} (role {})", format, role);
        Ok(Box::new(PipeWireInputStream {
            format,
            sender: Some(sender),
            thread_handle: Some(handle),
        }))
    }
}

struct PipeWireInputStream {
    format: StreamFormat,
    sender: Option<pw::channel::Sender<Command>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl InputStream for PipeWireInputStream {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn request_stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Command::Stop);
        }
    }

    fn release(&mut self) {
        self.request_stop();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            debug!("PipeWire capture thread joined");
        }
    }

    fn is_live(&self) -> bool {
        self.thread_handle.is_some()
    }
}

impl Drop for PipeWireInputStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run the PipeWire capture loop until told to stop
///
/// `ready` is consumed once the stream is connected.
fn run_capture_loop(
    format: StreamFormat,
    role: &'static str,
    sink: CaptureSink,
    receiver: pw::channel::Receiver<Command>,
    ready: &mut Option<oneshot::Sender<Result<(), String>>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    // Set up channel receiver to stop the loop
    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        Command::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: StreamFormat,
        sink: CaptureSink,
    }

    let user_data = UserData { format, sink };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => role,
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "voxgate-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            if let Some(format) = parse_format(param) {
                if format != user_data.format {
                    user_data.format = format;
                    user_data.sink.format(format);
                }
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let size = data.chunk().size() as usize;
            let frame_bytes = (user_data.format.channels as usize * 4).max(1);

            if let Some(raw) = data.data() {
                // forward whole frames only
                let size = size.min(raw.len());
                let whole = size - size % frame_bytes;
                if whole > 0 {
                    user_data.sink.chunk(raw[..whole].to_vec());
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod(format)?;
    let pod = Pod::from_bytes(&values).ok_or("Invalid audio format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(()));
    }

    // Run until stopped
    mainloop.run();

    Ok(())
}

/// Default PipeWire sink
#[derive(Default)]
pub struct PipeWireOutput;

impl PipeWireOutput {
    pub fn new() -> Self {
        Self
    }
}

struct SharedPosition(AtomicUsize);

impl Playhead for SharedPosition {
    fn position(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl OutputDevice for PipeWireOutput {
    fn start(
        &mut self,
        clip: Arc<AudioClip>,
        ended: PlaybackEndSink,
    ) -> Result<Box<dyn OutputStream>, PlaybackError> {
        let position = Arc::new(SharedPosition(AtomicUsize::new(0)));
        let finished = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = pw::channel::channel::<Command>();

        // start() is synchronous, so setup is awaited on a std channel
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread_position = position.clone();
        let thread_finished = finished.clone();
        let stream_id = ended.stream_id();
        let handle = thread::spawn(move || {
            let mut ready = Some(ready_tx);
            let result = run_playback_loop(
                clip,
                thread_position,
                thread_finished.clone(),
                receiver,
                &mut ready,
            );
            if let Some(ready) = ready.take() {
                let reason = result
                    .err()
                    .unwrap_or_else(|| "playback loop exited during setup".to_string());
                let _ = ready.send(Err(reason));
                return;
            }
            match result {
                Ok(()) => {
                    if thread_finished.load(Ordering::SeqCst) {
                        ended.ended();
                    }
                }
                Err(e) => {
                    error!("PipeWire playback failed: {}", e);
                    ended.failed(e);
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(PlaybackError::Device(e));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PlaybackError::Device(
                    "playback thread exited during setup".to_string(),
                ));
            }
        }

        debug!("PipeWire playback stream {} connected", stream_id);
        Ok(Box::new(PipeWirePlayback {
            position,
            sender: Some(sender),
            thread_handle: Some(handle),
        }))
    }
}

struct PipeWirePlayback {
    position: Arc<SharedPosition>,
    sender: Option<pw::channel::Sender<Command>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl OutputStream for PipeWirePlayback {
    fn playhead(&self) -> Arc<dyn Playhead> {
        self.position.clone()
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Command::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PipeWirePlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the PipeWire playback loop until the clip ends or it is stopped
///
/// `ready` is consumed once the stream is connected. A stream that errors
/// after that ends the loop with `Err`.
fn run_playback_loop(
    clip: Arc<AudioClip>,
    position: Arc<SharedPosition>,
    finished: Arc<AtomicBool>,
    receiver: pw::channel::Receiver<Command>,
    ready: &mut Option<mpsc::SyncSender<Result<(), String>>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        Command::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: StreamFormat,
        clip: Arc<AudioClip>,
        position: Arc<SharedPosition>,
        finished: Arc<AtomicBool>,
        failure: Rc<RefCell<Option<String>>>,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let failure = Rc::new(RefCell::new(None));

    let requested = StreamFormat {
        sample_rate: clip.sample_rate(),
        channels: clip.channels(),
    };
    let user_data = UserData {
        format: requested,
        clip,
        position,
        finished,
        failure: failure.clone(),
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "voxgate-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            if let Some(format) = parse_format(param) {
                user_data.format = format;
            }
        })
        .state_changed(|_, user_data, _old, new| {
            if let pw::stream::StreamState::Error(reason) = new {
                *user_data.failure.borrow_mut() = Some(reason);
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let out_channels = user_data.format.channels.max(1) as usize;
            let stride = std::mem::size_of::<f32>() * out_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let clip = &user_data.clip;
            let clip_channels = clip.channels() as usize;
            let start = user_data.position.position();
            let n_frames = (slice.len() / stride).min(clip.frames().saturating_sub(start));

            if n_frames == 0 {
                user_data.finished.store(true, Ordering::SeqCst);
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
                return;
            }

            // map output channel i onto clip channel i % clip_channels
            let samples = clip.samples();
            for frame in 0..n_frames {
                let src = (start + frame) * clip_channels;
                for ch in 0..out_channels {
                    let sample = samples[src + ch % clip_channels];
                    let offset = frame * stride + ch * 4;
                    slice[offset..offset + 4].copy_from_slice(&sample.to_le_bytes());
                }
            }
            let written = n_frames * stride;
            slice[written..].fill(0);
            user_data.position.0.store(start + n_frames, Ordering::Relaxed);

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = written as u32;
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod(requested)?;
    let pod = Pod::from_bytes(&values).ok_or("Invalid audio format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(()));
    }

    // Run until stopped, finished or failed
    mainloop.run();

    let failure = failure.borrow_mut().take();
    match failure {
        Some(reason) => Err(format!("PipeWire stream error: {}", reason)),
        None => Ok(()),
    }
}
