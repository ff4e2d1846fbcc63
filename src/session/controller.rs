//! Session lifecycle
//!
//! One controller task owns the (at most one) live session and is the only
//! place its state changes. Audio threads, the transport task and the UI
//! talk to it exclusively through `ControllerMessage`s.

use crate::audio::{codec, Analyzer, CaptureConfig};
use crate::error::{ErrorCategory, SessionError};
use crate::session::{
    CaptureHandle, ControllerMessage, EventSink, IdleTimer, Platform,
    PlaybackConfig, PlaybackScheduler, SessionEvent, SessionId, SpeakingChange, TransportEvent,
    TransportHandle, UserCommand,
};
use crate::transport::TransportConfig;
use chrono::{DateTime, Local};
use log::{debug, error, info, trace, warn};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to start a session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub credential: Option<String>,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub transport: TransportConfig,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential: None,
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            transport: TransportConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
}

/// Who is currently producing audio, meaningful only while `Open`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Activity {
    #[default]
    Listening,
    AgentSpeaking,
}

/// Snapshot published to the UI after every transition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: Phase,
    pub activity: Activity,
    pub error: Option<ErrorCategory>,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match (self.phase, self.activity) {
            (Phase::Idle, _) => "Idle",
            (Phase::Connecting, _) => "Connecting…",
            (Phase::Open, Activity::Listening) => "Listening",
            (Phase::Open, Activity::AgentSpeaking) => "Agent speaking",
            (Phase::Closing, _) => "Closing…",
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    frames_sent: u64,
    chunks_received: u64,
    chunks_played: u64,
    chunks_dropped: u64,
}

struct Session {
    id: SessionId,
    phase: Phase,
    activity: Activity,
    capture: Option<Box<dyn CaptureHandle>>,
    scheduler: Option<PlaybackScheduler>,
    transport: Option<Box<dyn TransportHandle>>,
    idle: IdleTimer,
    started_at: DateTime<Local>,
    stats: SessionStats,
}

impl Session {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: Phase::Connecting,
            activity: Activity::Listening,
            capture: None,
            scheduler: None,
            transport: None,
            idle: IdleTimer::new(idle_timeout),
            started_at: Local::now(),
            stats: SessionStats::default(),
        }
    }
}

pub struct SessionController<P: Platform> {
    config: SessionConfig,
    platform: P,
    tx: mpsc::UnboundedSender<ControllerMessage>,
    session: Option<Session>,
    last_error: Option<ErrorCategory>,
    status: watch::Sender<SessionStatus>,
    input_analyzer: Analyzer,
    output_analyzer: Analyzer,
}

impl<P: Platform> SessionController<P> {
    /// `tx` must feed the receiver later passed to `run`
    pub fn new(
        config: SessionConfig,
        platform: P,
        tx: mpsc::UnboundedSender<ControllerMessage>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            platform,
            tx,
            session: None,
            last_error: None,
            status,
            input_analyzer: Analyzer::new(),
            output_analyzer: Analyzer::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Microphone-side amplitude, fed by the capture graph
    pub fn input_analyzer(&self) -> Analyzer {
        self.input_analyzer.clone()
    }

    /// Speaker-side amplitude, fed by the output graph
    pub fn output_analyzer(&self) -> Analyzer {
        self.output_analyzer.clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.session.as_ref().and_then(|s| s.idle.deadline())
    }

    /// Process messages until shutdown
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControllerMessage>) {
        info!("Session controller started");
        loop {
            let deadline = self.idle_deadline();
            let message = tokio::select! {
                message = rx.recv() => message,
                _ = sleep_until(deadline) => {
                    self.poll_idle_timer(Instant::now());
                    continue;
                }
            };

            match message {
                Some(message) => {
                    if !self.handle(message, Instant::now()) {
                        break;
                    }
                }
                None => {
                    self.teardown("controller channel closed");
                    break;
                }
            }
        }
        info!("Session controller stopped");
    }

    /// Apply one message. Returns false once the controller should stop.
    pub fn handle(&mut self, message: ControllerMessage, now: Instant) -> bool {
        match message {
            ControllerMessage::Command(command) => {
                debug!("User command: {:?}", command);
                match command {
                    UserCommand::Toggle => {
                        if self.session.is_none() {
                            self.connect();
                        } else {
                            self.disconnect();
                        }
                    }
                    UserCommand::Connect => self.connect(),
                    UserCommand::Disconnect => self.disconnect(),
                    UserCommand::Shutdown => {
                        self.teardown("shutdown");
                        return false;
                    }
                }
            }
            ControllerMessage::Session { session, event } => {
                if self.session_id() != Some(session) {
                    trace!("Ignoring event for stale session {}", session);
                    return true;
                }
                self.on_session_event(event, now);
            }
        }
        true
    }

    /// Start a new session if none is active
    pub fn connect(&mut self) {
        if let Some(session) = &self.session {
            debug!("Connect ignored, session {} is {:?}", session.id, session.phase);
            return;
        }

        self.last_error = None;
        let credential = match self.config.credential.as_deref().map(str::trim) {
            Some(credential) if !credential.is_empty() => credential.to_string(),
            _ => {
                error!("Cannot connect: {}", SessionError::MissingCredentials);
                self.last_error = Some(ErrorCategory::MissingCredentials);
                self.publish();
                return;
            }
        };

        let session = Session::new(self.config.idle_timeout);
        info!("Session {} connecting", session.id);
        let sink = EventSink::new(session.id, self.tx.clone());
        self.session = Some(session);
        self.publish();

        if let Err(e) = self.acquire(&credential, sink) {
            error!("Failed to start session: {}", e);
            self.end_session(Some(e), "failed to start");
        }
    }

    pub fn disconnect(&mut self) {
        if self.session.is_some() {
            info!("Disconnect requested");
            self.end_session(None, "user disconnect");
        }
    }

    /// Fire the idle timer if its deadline has passed
    pub fn poll_idle_timer(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.idle.fire(now) {
            return;
        }
        if session.phase == Phase::Open && session.activity == Activity::Listening {
            info!("Session {} idle, closing", session.id);
            self.end_session(None, "idle timeout");
        }
    }

    /// Release every resource of the current session. Safe to call at any
    /// time and any number of times.
    pub fn teardown(&mut self, reason: &str) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.phase = Phase::Closing;
        self.status.send_replace(SessionStatus {
            phase: Phase::Closing,
            activity: session.activity,
            error: None,
        });

        // The connection goes first so no further remote events are
        // produced while the audio threads are being joined
        session.idle.cancel();
        if let Some(mut transport) = session.transport.take() {
            release("transport", || transport.close());
        }
        if let Some(mut scheduler) = session.scheduler.take() {
            release("output graph", || scheduler.close());
        }
        if let Some(mut capture) = session.capture.take() {
            release("capture", || capture.close());
        }

        self.input_analyzer.reset();
        self.output_analyzer.reset();

        let elapsed = Local::now() - session.started_at;
        info!(
            "Session {} ended after {:.1}s ({}): {} frames sent, {} chunks received, {} played, {} dropped",
            session.id,
            elapsed.num_milliseconds() as f64 / 1000.0,
            reason,
            session.stats.frames_sent,
            session.stats.chunks_received,
            session.stats.chunks_played,
            session.stats.chunks_dropped
        );

        self.publish();
    }

    fn acquire(&mut self, credential: &str, sink: EventSink) -> Result<(), SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        session.capture = Some(self.platform.open_capture(
            &self.config.capture,
            sink.clone(),
            self.input_analyzer.clone(),
        )?);

        let graph = self.platform.open_output(
            self.config.playback.sample_rate,
            sink.clone(),
            self.output_analyzer.clone(),
        )?;
        session.scheduler = Some(PlaybackScheduler::new(self.config.playback.clone(), graph));

        session.transport =
            Some(
                self.platform
                    .open_transport(&self.config.transport, credential, sink)?,
            );
        Ok(())
    }

    fn on_session_event(&mut self, event: SessionEvent, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            SessionEvent::Frame(frame) => {
                if session.phase != Phase::Open {
                    return;
                }
                let Some(transport) = session.transport.as_mut() else {
                    return;
                };
                // A failed send means the connection task has already ended;
                // its Closed or Error event decides how the session ends
                match transport.send(codec::encode(&frame.samples)) {
                    Ok(()) => session.stats.frames_sent += 1,
                    Err(e) => debug!("Dropping frame: {}", e),
                }
            }

            SessionEvent::DeviceFailed(message) => {
                self.end_session(Some(SessionError::Device(message)), "audio device failed");
            }

            SessionEvent::PlaybackFinished(id) => {
                let Some(scheduler) = session.scheduler.as_mut() else {
                    return;
                };
                let before = scheduler.in_flight_len();
                let change = scheduler.complete(id);
                if scheduler.in_flight_len() < before {
                    session.stats.chunks_played += 1;
                }
                if change == Some(SpeakingChange::Finished) {
                    session.activity = Activity::Listening;
                    session.idle.arm(now);
                    debug!("Agent finished speaking");
                    self.publish();
                }
            }

            SessionEvent::Transport(event) => self.on_transport_event(event, now),
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            TransportEvent::Opened => {
                if session.phase == Phase::Connecting {
                    session.phase = Phase::Open;
                    session.activity = Activity::Listening;
                    info!("Session {} open", session.id);
                    self.publish();
                }
            }

            TransportEvent::Audio(chunk) => {
                if session.phase != Phase::Open {
                    debug!("Ignoring chunk #{} outside an open session", chunk.seq);
                    return;
                }
                let Some(scheduler) = session.scheduler.as_mut() else {
                    return;
                };
                session.stats.chunks_received += 1;
                match scheduler.enqueue(&chunk) {
                    Ok(scheduled) => {
                        session.idle.cancel();
                        if scheduled.change == Some(SpeakingChange::Started) {
                            session.activity = Activity::AgentSpeaking;
                            debug!("Agent started speaking");
                            self.publish();
                        }
                    }
                    Err(_) => session.stats.chunks_dropped += 1,
                }
            }

            TransportEvent::Interrupted => {
                if session.phase != Phase::Open {
                    return;
                }
                if let Some(scheduler) = session.scheduler.as_mut() {
                    scheduler.interrupt();
                }
                session.activity = Activity::Listening;
                session.idle.arm(now);
                info!("Agent interrupted");
                self.publish();
            }

            TransportEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "closed by remote".to_string());
                self.end_session(None, &reason);
            }

            TransportEvent::Error(message) => {
                self.end_session(Some(SessionError::Transport(message)), "transport error");
            }
        }
    }

    fn end_session(&mut self, error: Option<SessionError>, reason: &str) {
        if let Some(e) = &error {
            error!("Session error: {}", e);
        }
        self.last_error = error.map(|e| e.category());
        self.teardown(reason);
        // Publish even when there was nothing to tear down
        self.publish();
    }

    fn publish(&mut self) {
        let status = match &self.session {
            Some(session) => SessionStatus {
                phase: session.phase,
                activity: session.activity,
                error: None,
            },
            None => SessionStatus {
                phase: Phase::Idle,
                activity: Activity::Listening,
                error: self.last_error,
            },
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Run a release step, containing any panic so the remaining steps still run
fn release(what: &str, step: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(step)).is_err() {
        warn!("Panic while releasing {}", what);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
