//! Voice session orchestration
//!
//! This module provides:
//! - The session controller state machine (connect, open, teardown)
//! - Gapless, interruptible playback scheduling
//! - The idle timer and the messages the controller consumes
//! - The platform seam for microphone, speaker and connection

mod controller;
mod events;
mod platform;
mod scheduler;
mod timer;

pub use controller::{
    Activity, Phase, SessionConfig, SessionController, SessionStatus, DEFAULT_IDLE_TIMEOUT,
};
pub use events::{
    BufferId, ControllerMessage, EventSink, InboundChunk, SessionEvent, SessionId,
    TransportEvent, UserCommand,
};
pub use platform::{CaptureHandle, PipeWirePlatform, Platform, TransportHandle};
pub use scheduler::{
    OutputGraph, PlaybackConfig, PlaybackScheduler, ScheduledBuffer, SpeakingChange,
};
pub use timer::IdleTimer;
