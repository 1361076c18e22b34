//! voxgate - record, denoise and compare from the command line
//!
//! This is the main entry point for the voxgate binary.

mod cli;
mod tokio_runtime;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Args, Command, Source};
use log::info;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use voxgate::audio::export::{self, ClipExporter};
use voxgate::audio::{InputDevice, OutputDevice, SignalSource, SimulatedInput, SimulatedOutput};
use voxgate::dsp;
use voxgate::settings::Settings;
use voxgate::visual::VisualizationFrame;
use voxgate::{ComparisonSession, Phase, PlaybackChannel};

/// How often the terminal meters refresh
const METER_INTERVAL: Duration = Duration::from_millis(100);

const BAR_GLYPHS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = Args::parse();
    cli::init_logging(&args);

    let mut settings = Settings::load(args.config.as_deref())?;

    match args.command {
        Command::Compare {
            duration_ms,
            source,
            replay,
            export_dir,
            no_playback,
        } => {
            if let Some(ms) = duration_ms {
                settings.capture.max_duration_ms = ms;
            }
            let options = CompareOptions {
                export_dir,
                playback: !no_playback,
            };
            let runtime = tokio_runtime::build()?;
            runtime.block_on(compare(&settings, source, replay.as_deref(), options))
        }
        Command::Denoise {
            input,
            output,
            attenuation_db,
            threshold_ratio,
            profile_window_ms,
        } => {
            if let Some(db) = attenuation_db {
                settings.gate.attenuation_db = db;
            }
            if let Some(ratio) = threshold_ratio {
                settings.gate.threshold_ratio = ratio;
            }
            if let Some(ms) = profile_window_ms {
                settings.gate.profile_window_ms = ms;
            }
            denoise(&settings, &input, &output)
        }
    }
}

struct CompareOptions {
    export_dir: Option<PathBuf>,
    playback: bool,
}

async fn compare(
    settings: &Settings,
    source: Source,
    replay: Option<&Path>,
    options: CompareOptions,
) -> Result<()> {
    let config = settings.session_config();

    match source {
        Source::Simulated => {
            let mut input = SimulatedInput::new();
            if let Some(path) = replay {
                input = input.with_source(SignalSource::Clip(Arc::new(export::load(path)?)));
            }
            let session = ComparisonSession::new(input, SimulatedOutput::new(), config)?;
            run_compare(session, options).await
        }
        #[cfg(feature = "pipewire")]
        Source::Pipewire => {
            use voxgate::audio::{PipeWireInput, PipeWireOutput};

            if replay.is_some() {
                bail!("--replay only works with the simulated source");
            }
            let session =
                ComparisonSession::new(PipeWireInput::new(), PipeWireOutput::new(), config)?;
            run_compare(session, options).await
        }
        #[cfg(not(feature = "pipewire"))]
        Source::Pipewire => {
            bail!("voxgate was built without PipeWire support; rebuild with --features pipewire")
        }
    }
}

async fn run_compare<I: InputDevice, O: OutputDevice>(
    mut session: ComparisonSession<I, O>,
    options: CompareOptions,
) -> Result<()> {
    session.start_capture().await?;
    info!("Recording started");

    while session.phase() == Phase::Recording {
        // recv is cancel-safe, so timing out a step loses nothing
        let _ = timeout(METER_INTERVAL, session.step()).await;
        if session.phase() == Phase::Recording {
            let level = session.input_level();
            print_status(&format!(
                "recording {:>5.2}s  {}",
                session.recorded().as_secs_f64(),
                meter(level.rms, 30)
            ));
        }
    }
    println!();

    if session.run_until_settled().await != Phase::Ready {
        let err = session
            .last_error()
            .cloned()
            .context("session stopped without an error")?;
        return Err(err.into());
    }

    let (Some(original), Some(processed)) = (session.original(), session.processed()) else {
        bail!("session is ready but holds no clips");
    };
    println!(
        "captured {:.2}s at {} Hz, {} channel(s); noise floor {:.6}",
        original.duration_seconds(),
        original.sample_rate(),
        original.channels(),
        processed.profile().mean_magnitude()
    );

    if let Some(dir) = options.export_dir {
        let exporter = ClipExporter::new().with_recordings_dir(dir);
        let original_path = exporter.save(original, "original")?;
        let processed_path = exporter.save(processed.clip(), "processed")?;
        println!("saved {}", original_path.display());
        println!("saved {}", processed_path.display());
    }

    if options.playback {
        for channel in PlaybackChannel::ALL {
            println!("playing {}", channel);
            session.play(channel)?;
            while session.active_channel().is_some() {
                let _ = timeout(METER_INTERVAL, session.step()).await;
                if let Some(frame) = session.latest_frame() {
                    print_status(&spectrum(&frame));
                }
                if session.phase() == Phase::Error {
                    break;
                }
            }
            println!();

            if let Some(err) = session.last_error().cloned() {
                return Err(err.into());
            }
        }
    }

    session.reset();
    Ok(())
}

fn denoise(settings: &Settings, input: &Path, output: &Path) -> Result<()> {
    let clip = export::load(input)?;
    info!(
        "denoising {} ({:.2}s, {} Hz)",
        input.display(),
        clip.duration_seconds(),
        clip.sample_rate()
    );

    let processed = dsp::reduce_noise(
        Arc::new(clip),
        settings.analysis,
        settings.gate.profile_window_ms,
        &settings.gate.params(),
    )
    .with_context(|| format!("Failed to denoise {}", input.display()))?;

    export::save_to(processed.clip(), output)?;
    println!("wrote {}", output.display());
    Ok(())
}

fn print_status(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "\r{}\x1b[K", line);
    let _ = stdout.flush();
}

/// Horizontal meter for a linear level
fn meter(level: f32, width: usize) -> String {
    let filled = ((level.clamp(0.0, 1.0) * width as f32).round() as usize).min(width);
    format!("[{}{}]", "#".repeat(filled), " ".repeat(width - filled))
}

fn spectrum(frame: &VisualizationFrame) -> String {
    let top = (BAR_GLYPHS.len() - 1) as f32;
    let bars: String = frame
        .bars
        .iter()
        .map(|bar| BAR_GLYPHS[(bar.clamp(0.0, 1.0) * top).round() as usize])
        .collect();
    format!("{:<9} {}", frame.channel.to_string(), bars)
}
