//! Tokio runtime for the binary
//!
//! Capture, playback and the visualisation tick are light; the FFT work
//! goes to the blocking pool, so two workers are plenty.

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

pub fn build() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("voxgate-worker")
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")
}
