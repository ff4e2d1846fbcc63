//! JSON wire messages for the conversational endpoint

use serde::{Deserialize, Serialize};

/// MIME type of outbound microphone audio
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

// =============================================================================
// Client -> server
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    pub fn setup(model: &str, system_instruction: Option<&str>) -> Self {
        ClientMessage::Setup(Setup {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
            system_instruction: system_instruction.map(|text| Content {
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }),
        })
    }

    pub fn audio(payload: String) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: INPUT_MIME_TYPE.to_string(),
                data: payload,
            }],
        })
    }
}

// =============================================================================
// Server -> client
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// What a server message means for the session, in message order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSignal {
    SetupComplete,
    Audio(String),
    Interrupted,
    TurnComplete,
    GoAway,
}

impl ServerMessage {
    pub fn into_signals(self) -> Vec<ServerSignal> {
        let mut signals = Vec::new();

        if self.setup_complete.is_some() {
            signals.push(ServerSignal::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if content.interrupted {
                signals.push(ServerSignal::Interrupted);
            }
            if let Some(turn) = content.model_turn {
                signals.extend(
                    turn.parts
                        .into_iter()
                        .filter_map(|part| part.inline_data)
                        .filter(|data| data.mime_type.starts_with("audio/pcm"))
                        .map(|data| ServerSignal::Audio(data.data)),
                );
            }
            if content.turn_complete {
                signals.push(ServerSignal::TurnComplete);
            }
        }

        if self.go_away.is_some() {
            signals.push(ServerSignal::GoAway);
        }

        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_serialization() {
        let message = ClientMessage::setup("models/test", Some("Be brief."));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/test",
                    "generationConfig": { "responseModalities": ["AUDIO"] },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );

        let bare = serde_json::to_value(ClientMessage::setup("m", None)).unwrap();
        assert!(bare["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_audio_serialization() {
        let value = serde_json::to_value(ClientMessage::audio("AAA=".to_string())).unwrap();
        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAA=" }]
                }
            })
        );
    }

    #[test]
    fn test_parse_setup_complete() {
        let message: ServerMessage = serde_json::from_str(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(message.into_signals(), vec![ServerSignal::SetupComplete]);
    }

    #[test]
    fn test_parse_audio_parts_in_order() {
        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}},
            {"text":"hello"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AwQ="}}
        ]}}}"#;
        let message: ServerMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            message.into_signals(),
            vec![
                ServerSignal::Audio("AQI=".to_string()),
                ServerSignal::Audio("AwQ=".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_interruption_and_turn_complete() {
        let message: ServerMessage =
            serde_json::from_str(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(message.into_signals(), vec![ServerSignal::Interrupted]);

        let message: ServerMessage =
            serde_json::from_str(r#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert_eq!(message.into_signals(), vec![ServerSignal::TurnComplete]);
    }

    #[test]
    fn test_parse_go_away_and_unknown() {
        let message: ServerMessage =
            serde_json::from_str(r#"{"goAway":{"timeLeft":"5s"}}"#).unwrap();
        assert_eq!(message.into_signals(), vec![ServerSignal::GoAway]);

        let message: ServerMessage =
            serde_json::from_str(r#"{"usageMetadata":{"totalTokenCount":3}}"#).unwrap();
        assert!(message.into_signals().is_empty());
    }
}
