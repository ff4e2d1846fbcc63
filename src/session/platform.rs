//! Resources a session acquires from the host
//!
//! The controller only sees these traits, so tests can substitute devices
//! and connections that never touch PipeWire or the network.

use crate::audio::{Analyzer, CaptureConfig, PayloadBlob, PipeWireCapture, PipeWireOutput};
use crate::error::SessionError;
use crate::session::{EventSink, OutputGraph};
use crate::transport::{TransportConfig, WebSocketTransport};
use tokio::runtime::Handle;

/// An open microphone graph
pub trait CaptureHandle: Send {
    /// Stop capturing and release the device. Must be idempotent.
    fn close(&mut self);
}

/// An open connection to the remote endpoint
pub trait TransportHandle: Send {
    fn send(&mut self, payload: PayloadBlob) -> Result<(), SessionError>;

    /// Close the connection. Must be idempotent and must not report
    /// `Closed` for a close the session asked for.
    fn close(&mut self);
}

pub trait Platform: Send {
    fn open_capture(
        &mut self,
        config: &CaptureConfig,
        sink: EventSink,
        analyzer: Analyzer,
    ) -> Result<Box<dyn CaptureHandle>, SessionError>;

    fn open_output(
        &mut self,
        sample_rate: u32,
        sink: EventSink,
        analyzer: Analyzer,
    ) -> Result<Box<dyn OutputGraph>, SessionError>;

    fn open_transport(
        &mut self,
        config: &TransportConfig,
        credential: &str,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, SessionError>;
}

/// PipeWire audio plus a WebSocket connection on the shared tokio runtime
pub struct PipeWirePlatform {
    runtime: Handle,
}

impl PipeWirePlatform {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Platform for PipeWirePlatform {
    fn open_capture(
        &mut self,
        config: &CaptureConfig,
        sink: EventSink,
        analyzer: Analyzer,
    ) -> Result<Box<dyn CaptureHandle>, SessionError> {
        let capture =
            PipeWireCapture::open(config.clone(), sink, analyzer).map_err(SessionError::Device)?;
        Ok(Box::new(capture))
    }

    fn open_output(
        &mut self,
        sample_rate: u32,
        sink: EventSink,
        analyzer: Analyzer,
    ) -> Result<Box<dyn OutputGraph>, SessionError> {
        let output =
            PipeWireOutput::open(sample_rate, sink, analyzer).map_err(SessionError::Device)?;
        Ok(Box::new(output))
    }

    fn open_transport(
        &mut self,
        config: &TransportConfig,
        credential: &str,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, SessionError> {
        let transport = WebSocketTransport::open(&self.runtime, config, credential, sink)?;
        Ok(Box::new(transport))
    }
}
