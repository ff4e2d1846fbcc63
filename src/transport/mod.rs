//! WebSocket transport to the conversational endpoint
//!
//! - Endpoint: configurable `wss://` URL, credential passed as `key`
//! - Protocol: JSON text frames (see `messages`)
//! - Audio: PCM 16-bit little-endian, base64; 16 kHz out, 24 kHz in
//!
//! The connection runs as one tokio task per session. Outbound payloads are
//! queued through an unbounded channel; inbound messages are translated into
//! `TransportEvent`s and posted to the session controller in arrival order.

pub mod messages;

use crate::audio::PayloadBlob;
use crate::error::SessionError;
use crate::session::{EventSink, InboundChunk, SessionEvent, TransportEvent, TransportHandle};
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use messages::{ClientMessage, ServerMessage, ServerSignal};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub endpoint: String,
    pub model: String,
    pub system_instruction: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: None,
        }
    }
}

/// Build the connection URL with the credential attached
pub fn build_url(endpoint: &str, credential: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| SessionError::Transport(format!("invalid endpoint {}: {}", endpoint, e)))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(SessionError::Transport(format!(
            "endpoint must be ws:// or wss://, got {}",
            url.scheme()
        )));
    }
    url.query_pairs_mut().append_pair("key", credential);
    Ok(url)
}

enum Outbound {
    Audio(PayloadBlob),
    Close,
}

/// One streaming connection, owned by a single session
pub struct WebSocketTransport {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Start connecting; `Opened` is posted once the endpoint accepts setup
    pub fn open(
        runtime: &Handle,
        config: &TransportConfig,
        credential: &str,
        sink: EventSink,
    ) -> Result<Self, SessionError> {
        let url = build_url(&config.endpoint, credential)?;
        let setup = ClientMessage::setup(&config.model, config.system_instruction.as_deref());

        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run_connection(url, setup, rx, sink));

        Ok(Self {
            outbound: Some(tx),
            task: Some(task),
        })
    }
}

impl TransportHandle for WebSocketTransport {
    fn send(&mut self, payload: PayloadBlob) -> Result<(), SessionError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| SessionError::Transport("transport closed".to_string()))?;
        outbound
            .send(Outbound::Audio(payload))
            .map_err(|_| SessionError::Transport("connection task ended".to_string()))
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
        // The task finishes the close handshake on its own
        self.task.take();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    url: Url,
    setup: ClientMessage,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    sink: EventSink,
) {
    let host = url.host_str().unwrap_or_default().to_string();
    let connect = tokio_tungstenite::connect_async(url.as_str());
    tokio::pin!(connect);

    let ws_stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((ws_stream, _response)) => break ws_stream,
                Err(e) => {
                    warn!("Connection to {} failed: {}", host, e);
                    sink.post(SessionEvent::Transport(TransportEvent::Error(e.to_string())));
                    return;
                }
            },
            message = outbound.recv() => match message {
                // Nothing is sent before the session opens
                Some(Outbound::Audio(_)) => continue,
                Some(Outbound::Close) | None => {
                    debug!("Transport closed while connecting");
                    return;
                }
            },
        }
    };

    info!("Connected to {}", host);
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    if let Err(e) = send_json(&mut ws_sink, &setup).await {
        sink.post(SessionEvent::Transport(TransportEvent::Error(e)));
        return;
    }

    let mut seq: u64 = 0;
    let outcome = loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(Outbound::Audio(payload)) => {
                    if let Err(e) = send_json(&mut ws_sink, &ClientMessage::audio(payload)).await {
                        break Some(TransportEvent::Error(e));
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_sink.close().await;
                    debug!("Transport closed locally");
                    break None;
                }
            },

            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => dispatch(message, &mut seq, &sink),
                        Err(e) => break Some(TransportEvent::Error(format!("malformed server message: {}", e))),
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    match serde_json::from_slice::<ServerMessage>(&data) {
                        Ok(message) => dispatch(message, &mut seq, &sink),
                        Err(e) => break Some(TransportEvent::Error(format!("malformed server message: {}", e))),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                        break Some(TransportEvent::Error(e.to_string()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    info!("Connection closed by server: {}", reason.as_deref().unwrap_or("no reason"));
                    break Some(TransportEvent::Closed(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(TransportEvent::Error(e.to_string())),
                None => break Some(TransportEvent::Closed(None)),
            },
        }
    };

    if let Some(event) = outcome {
        sink.post(SessionEvent::Transport(event));
    }
}

fn dispatch(message: ServerMessage, seq: &mut u64, sink: &EventSink) {
    for signal in message.into_signals() {
        let event = match signal {
            ServerSignal::SetupComplete => TransportEvent::Opened,
            ServerSignal::Audio(payload) => {
                let chunk = InboundChunk { seq: *seq, payload };
                *seq += 1;
                TransportEvent::Audio(chunk)
            }
            ServerSignal::Interrupted => TransportEvent::Interrupted,
            ServerSignal::TurnComplete => {
                trace!("Turn complete");
                continue;
            }
            ServerSignal::GoAway => TransportEvent::Closed(Some("server is going away".to_string())),
        };
        sink.post(SessionEvent::Transport(event));
    }
}

async fn send_json<S>(ws_sink: &mut S, message: &ClientMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
    ws_sink
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| format!("Failed to send message: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ControllerMessage;
    use uuid::Uuid;

    #[test]
    fn test_build_url_appends_key() {
        let url = build_url("wss://example.com/live?alt=json", "s3cret").unwrap();
        assert_eq!(url.as_str(), "wss://example.com/live?alt=json&key=s3cret");
    }

    #[test]
    fn test_build_url_rejects_bad_endpoints() {
        assert!(matches!(
            build_url("not a url", "k"),
            Err(SessionError::Transport(_))
        ));
        assert!(matches!(
            build_url("https://example.com", "k"),
            Err(SessionError::Transport(_))
        ));
    }

    #[test]
    fn test_dispatch_numbers_chunks_in_arrival_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4();
        let sink = EventSink::new(session, tx);
        let mut seq = 0;

        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AwQ="}}
        ]},"turnComplete":true}}"#;
        dispatch(serde_json::from_str(text).unwrap(), &mut seq, &sink);
        dispatch(
            serde_json::from_str(r#"{"serverContent":{"interrupted":true}}"#).unwrap(),
            &mut seq,
            &sink,
        );

        let mut events = Vec::new();
        while let Ok(ControllerMessage::Session { session: id, event }) = rx.try_recv() {
            assert_eq!(id, session);
            if let SessionEvent::Transport(event) = event {
                events.push(event);
            }
        }
        assert_eq!(
            events,
            vec![
                TransportEvent::Audio(InboundChunk {
                    seq: 0,
                    payload: "AQI=".to_string()
                }),
                TransportEvent::Audio(InboundChunk {
                    seq: 1,
                    payload: "AwQ=".to_string()
                }),
                TransportEvent::Interrupted,
            ]
        );
        assert_eq!(seq, 2);
    }
}
