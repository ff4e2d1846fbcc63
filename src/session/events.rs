//! Messages converging on the session controller
//!
//! The capture thread, the output render thread, the transport task and the
//! UI all post into one unbounded queue. Everything except UI commands is
//! tagged with the session it was produced for, so late callbacks from a
//! session that has already been torn down can be recognised and dropped.

use crate::audio::AudioFrame;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Identifies one scheduled playback buffer within a session
pub type BufferId = u64;

#[derive(Debug)]
pub enum ControllerMessage {
    Command(UserCommand),
    Session {
        session: SessionId,
        event: SessionEvent,
    },
}

/// Actions available from the UI surface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserCommand {
    /// Connect when idle, disconnect otherwise
    Toggle,
    Connect,
    Disconnect,
    /// Tear down and stop the controller loop
    Shutdown,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// One fixed-size block from the microphone
    Frame(AudioFrame),
    /// An audio graph failed after it was opened
    DeviceFailed(String),
    Transport(TransportEvent),
    /// The output graph finished rendering a buffer
    PlaybackFinished(BufferId),
}

/// Inbound events from the remote endpoint, in delivery order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Audio(InboundChunk),
    Interrupted,
    Closed(Option<String>),
    Error(String),
}

/// Encoded audio from the remote endpoint, tagged with its arrival order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundChunk {
    pub seq: u64,
    pub payload: String,
}

/// Posting handle given to every event source of one session
#[derive(Clone, Debug)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<ControllerMessage>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<ControllerMessage>) -> Self {
        Self { session, tx }
    }

    /// Post an event; returns false once the controller has gone away
    pub fn post(&self, event: SessionEvent) -> bool {
        self.tx
            .send(ControllerMessage::Session {
                session: self.session,
                event,
            })
            .is_ok()
    }
}
