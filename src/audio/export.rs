//! Writing clips to disk and reading them back
//!
//! Files go through the WAV codec, so exported recordings are always
//! 16-bit PCM regardless of what the input device delivered.

use super::codec;
use crate::models::AudioClip;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Saves and loads WAV recordings in one directory
pub struct ClipExporter {
    recordings_dir: PathBuf,
}

impl ClipExporter {
    /// Exporter rooted at the per-user data directory
    pub fn new() -> Self {
        let recordings_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxgate")
            .join("recordings");

        Self { recordings_dir }
    }

    /// Set the recordings directory
    pub fn with_recordings_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.recordings_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.recordings_dir)
    }

    /// Unique path for a new file, `<label>_<timestamp>_<id>.wav`
    pub fn generate_filename(&self, label: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        self.recordings_dir
            .join(format!("{}_{}_{}.wav", label, timestamp, &uuid[..8]))
    }

    /// Save a clip, generating a file name from `label`
    ///
    /// Returns the path to the saved file
    pub fn save(&self, clip: &AudioClip, label: &str) -> Result<PathBuf> {
        self.ensure_dir().with_context(|| {
            format!(
                "Failed to create recordings directory {}",
                self.recordings_dir.display()
            )
        })?;
        let path = self.generate_filename(label);
        save_to(clip, &path)?;
        Ok(path)
    }

    /// List WAV files in the recordings directory, newest first
    pub fn list_recordings(&self) -> Result<Vec<PathBuf>> {
        self.ensure_dir()
            .context("Failed to access recordings directory")?;

        let mut recordings: Vec<PathBuf> = std::fs::read_dir(&self.recordings_dir)
            .context("Failed to read recordings directory")?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.to_string_lossy().to_lowercase() == "wav")
                    .unwrap_or(false)
            })
            .collect();

        // Sort by modification time, newest first
        recordings.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });

        Ok(recordings)
    }
}

impl Default for ClipExporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode `clip` and write it to `path`
pub fn save_to(clip: &AudioClip, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let bytes = codec::encode(clip)
        .with_context(|| format!("Failed to encode {}", path.display()))?;
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Read and decode a WAV file
pub fn load(path: impl AsRef<Path>) -> Result<AudioClip> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to open {}", path.display()))?;
    codec::decode(&bytes).with_context(|| format!("Failed to decode {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("voxgate-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_filenames_carry_label_and_id() {
        let exporter = ClipExporter::new().with_recordings_dir("/tmp/recordings");
        let path = exporter.generate_filename("processed");
        let name = path.file_name().unwrap().to_string_lossy().to_string();

        assert!(path.starts_with("/tmp/recordings"));
        assert!(name.starts_with("processed_"));
        assert!(name.ends_with(".wav"));
        // processed_YYYYmmdd_HHMMSS_xxxxxxxx.wav
        assert_eq!(name.len(), "processed_".len() + 15 + 1 + 8 + 4);
        assert_ne!(path, exporter.generate_filename("processed"));
    }

    #[test]
    fn test_saved_clips_load_back() {
        let dir = scratch_dir();
        let exporter = ClipExporter::new().with_recordings_dir(&dir);
        let clip = AudioClip::new(16000, 2, vec![0.5, -0.5, 0.25, -0.25]).unwrap();

        let path = exporter.save(&clip, "original").unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.sample_rate(), 16000);
        assert_eq!(loaded.channels(), 2);
        assert_eq!(loaded.frames(), 2);
        assert_eq!(exporter.list_recordings().unwrap(), vec![path]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_loading_garbage_fails_with_context() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.wav");
        std::fs::write(&path, b"RIFF0000WAVE").unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.wav"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
