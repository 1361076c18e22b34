//! Command-line interface for voxgate
//!
//! Handles argument parsing and logging configuration.

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;

/// voxgate - record a voice sample, gate its background noise, compare
#[derive(Parser, Debug)]
#[command(name = "voxgate")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (defaults to ~/.config/voxgate/settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record, denoise and play back both versions
    Compare {
        /// Recording cap in milliseconds, overrides the settings file
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Where the audio comes from
        #[arg(long, value_enum, default_value_t = Source::Simulated)]
        source: Source,

        /// Replay this WAV file through the simulated microphone
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Save both clips to this directory
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// Skip A/B playback
        #[arg(long)]
        no_playback: bool,
    },

    /// Denoise a WAV file offline
    Denoise {
        input: PathBuf,
        output: PathBuf,

        #[arg(long, allow_negative_numbers = true)]
        attenuation_db: Option<f32>,

        #[arg(long)]
        threshold_ratio: Option<f32>,

        #[arg(long)]
        profile_window_ms: Option<u32>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    /// Generated test voice over a noise floor
    Simulated,
    /// The default PipeWire microphone and speakers
    Pipewire,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("voxgate", args.log_level());

    // PipeWire internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("pipewire", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_maps_to_levels() {
        let args = Args::try_parse_from(["voxgate", "-vv", "compare"]).unwrap();
        assert_eq!(args.log_level(), LevelFilter::Debug);

        let args = Args::try_parse_from(["voxgate", "compare", "-q", "-v"]).unwrap();
        assert_eq!(args.log_level(), LevelFilter::Error);
    }

    #[test]
    fn test_denoise_accepts_negative_attenuation() {
        let args = Args::try_parse_from([
            "voxgate",
            "denoise",
            "in.wav",
            "out.wav",
            "--attenuation-db",
            "-30",
        ])
        .unwrap();

        let Command::Denoise {
            input,
            attenuation_db,
            threshold_ratio,
            ..
        } = args.command
        else {
            panic!("expected denoise");
        };
        assert_eq!(input, PathBuf::from("in.wav"));
        assert_eq!(attenuation_db, Some(-30.0));
        assert_eq!(threshold_ratio, None);
    }

    #[test]
    fn test_compare_defaults_to_simulated_source() {
        let args = Args::try_parse_from(["voxgate", "compare", "--duration-ms", "2000"]).unwrap();
        let Command::Compare {
            source,
            duration_ms,
            no_playback,
            ..
        } = args.command
        else {
            panic!("expected compare");
        };
        assert_eq!(source, Source::Simulated);
        assert_eq!(duration_ms, Some(2000));
        assert!(!no_playback);
    }
}
