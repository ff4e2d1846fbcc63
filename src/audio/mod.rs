//! Audio capture, playback and analysis using PipeWire
//!
//! This module provides:
//! - Microphone capture at 16kHz mono, delivered in fixed-size frames
//! - Speaker output at 24kHz rendered from a shared timeline
//! - PCM16/base64 payload encoding
//! - FFT amplitude estimation for the orb

mod analyzer;
mod capture;
pub mod codec;
mod playback;

pub use analyzer::Analyzer;
pub use capture::{AudioFrame, CaptureConfig, PipeWireCapture};
pub use codec::PayloadBlob;
pub use playback::{PipeWireOutput, PLAYBACK_SAMPLE_RATE};

use log::warn;
use std::thread::JoinHandle;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Wait for a stopped PipeWire thread. The thread quits on its next loop
/// iteration after `Stop`, so this is short; on a multi-thread runtime worker
/// the wait still goes through `block_in_place` so other tasks keep running.
fn join_audio_thread(name: &str, handle: JoinHandle<()>) {
    let on_worker = Handle::try_current()
        .map(|runtime| runtime.runtime_flavor() == RuntimeFlavor::MultiThread)
        .unwrap_or(false);
    let joined = if on_worker {
        tokio::task::block_in_place(|| handle.join())
    } else {
        handle.join()
    };
    if joined.is_err() {
        warn!("{} thread panicked", name);
    }
}
