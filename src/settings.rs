//! User settings loaded from JSON
//!
//! Settings live in `~/.config/voxgate/settings.json` unless a path is
//! given explicitly. Every field has a default, so a partial file (or no
//! file at all) is fine.

use crate::audio::CaptureConstraints;
use crate::dsp::{AnalysisConfig, GateParams, DEFAULT_PROFILE_WINDOW_MS};
use crate::state::SessionConfig;
use crate::visual::VisualConfig;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Recording auto-stops after this many milliseconds
    pub max_duration_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let constraints = CaptureConstraints::default();
        Self {
            echo_cancellation: constraints.echo_cancellation,
            noise_suppression: constraints.noise_suppression,
            auto_gain_control: constraints.auto_gain_control,
            sample_rate: constraints.sample_rate,
            channels: constraints.channels,
            max_duration_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    pub attenuation_db: f32,
    pub threshold_ratio: f32,
    pub profile_window_ms: u32,
}

impl Default for GateSettings {
    fn default() -> Self {
        let params = GateParams::default();
        Self {
            attenuation_db: params.attenuation_db,
            threshold_ratio: params.threshold_ratio,
            profile_window_ms: DEFAULT_PROFILE_WINDOW_MS,
        }
    }
}

impl GateSettings {
    pub fn params(&self) -> GateParams {
        GateParams {
            attenuation_db: self.attenuation_db,
            threshold_ratio: self.threshold_ratio,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub capture: CaptureSettings,
    pub analysis: AnalysisConfig,
    pub gate: GateSettings,
    pub visual: VisualConfig,
}

impl Settings {
    /// Default location of the settings file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("voxgate").join(SETTINGS_FILE))
    }

    /// Load from `path`, or from the default location when it exists
    ///
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => {
                    debug!("no settings file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))?;
        debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }

    pub fn constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            echo_cancellation: self.capture.echo_cancellation,
            noise_suppression: self.capture.noise_suppression,
            auto_gain_control: self.capture.auto_gain_control,
            sample_rate: self.capture.sample_rate,
            channels: self.capture.channels,
        }
    }

    /// Session configuration these settings describe
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            constraints: self.constraints(),
            max_duration: Duration::from_millis(self.capture.max_duration_ms),
            analysis: self.analysis,
            profile_window_ms: self.gate.profile_window_ms,
            gate: self.gate.params(),
            visual: self.visual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_session_defaults() {
        assert_eq!(Settings::default().session_config(), SessionConfig::default());
    }

    #[test]
    fn test_partial_json_fills_in_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{ "capture": { "max_duration_ms": 3000, "noise_suppression": false },
                 "gate": { "attenuation_db": -30.0 } }"#,
        )
        .unwrap();

        assert_eq!(settings.capture.max_duration_ms, 3000);
        assert!(!settings.capture.noise_suppression);
        assert!(settings.capture.echo_cancellation);
        assert_eq!(settings.gate.attenuation_db, -30.0);
        assert_eq!(settings.gate.threshold_ratio, 1.5);
        assert_eq!(settings.analysis, AnalysisConfig::default());

        let config = settings.session_config();
        assert_eq!(config.max_duration, Duration::from_millis(3000));
        assert!(!config.constraints.noise_suppression);
    }

    #[test]
    fn test_saved_settings_load_back() {
        let dir = std::env::temp_dir().join(format!("voxgate-settings-{}", uuid::Uuid::new_v4()));
        let path = dir.join(SETTINGS_FILE);
        let mut settings = Settings::default();
        settings.visual.bar_count = 16;
        settings.capture.sample_rate = Some(16000);

        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load(Some(&path)).unwrap(), settings);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = std::env::temp_dir().join("voxgate-does-not-exist.json");
        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("voxgate-does-not-exist.json"));
    }
}
