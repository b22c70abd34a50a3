//! Murf WebSocket message types.
//!
//! Outbound messages are JSON objects distinguished by their fields rather than a
//! type tag:
//!
//! - text: `{"voice_config": {...}, "context_id": "...", "text": "...", "end": false}`
//! - end of context: `{"context_id": "...", "end": true}`
//! - clear (cancel): `{"clear": true, "context_id": "..."}`
//!
//! Inbound messages carry base64 audio, a final marker or an error, each optionally
//! tagged with the context id they belong to.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::config::Pronunciation;
use crate::core::tts::base::ContextId;

// =============================================================================
// Outbound
// =============================================================================

/// Per-message voice configuration block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceConfig {
    pub voice_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,

    pub rate: i32,

    pub pitch: i32,

    pub pronunciation_dictionary: BTreeMap<String, Pronunciation>,

    pub variation: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_native_locale: Option<String>,
}

/// Messages sent from the adapter to Murf.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MurfClientMessage {
    /// Text to synthesize under a context
    Text {
        voice_config: VoiceConfig,
        context_id: ContextId,
        text: String,
        end: bool,
    },
    /// No further text for the context
    End { context_id: ContextId, end: bool },
    /// Abandon the context
    Clear { clear: bool, context_id: ContextId },
}

impl MurfClientMessage {
    pub fn text(
        voice_config: VoiceConfig,
        context_id: ContextId,
        text: impl Into<String>,
        end: bool,
    ) -> Self {
        Self::Text {
            voice_config,
            context_id,
            text: text.into(),
            end,
        }
    }

    pub fn end(context_id: ContextId) -> Self {
        Self::End {
            context_id,
            end: true,
        }
    }

    pub fn clear(context_id: ContextId) -> Self {
        Self::Clear {
            clear: true,
            context_id,
        }
    }

    /// Returns the context this message belongs to.
    pub fn context_id(&self) -> &ContextId {
        match self {
            Self::Text { context_id, .. }
            | Self::End { context_id, .. }
            | Self::Clear { context_id, .. } => context_id,
        }
    }

    /// Returns whether this message cancels its context.
    #[inline]
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear { .. })
    }

    /// Serializes the message to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Raw inbound message as sent by Murf.
#[derive(Debug, Clone, Deserialize)]
struct MurfServerMessage {
    #[serde(default)]
    context_id: Option<Value>,

    #[serde(default)]
    audio: Option<String>,

    #[serde(rename = "final", default)]
    is_final: Option<bool>,

    #[serde(default)]
    error: Option<Value>,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Decoded audio, possibly also marking the end of the context
    Audio {
        context_id: Option<ContextId>,
        data: Bytes,
        is_final: bool,
    },
    /// All audio for the context has been sent
    Final { context_id: Option<ContextId> },
    /// Provider error
    Error {
        context_id: Option<ContextId>,
        message: String,
    },
    /// Well-formed but unrecognised message
    Unknown,
}

/// Inbound message that violates the wire format.
#[derive(Debug, Error)]
pub enum MessageParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("context_id must be a string, got {0}")]
    InvalidContextId(Value),

    #[error("invalid base64 audio: {0}")]
    InvalidAudio(#[from] base64::DecodeError),
}

/// Parses and classifies a text frame received from Murf.
///
/// Errors take precedence over audio, and audio over a bare final marker.
pub fn parse_server_message(text: &str) -> Result<ServerEvent, MessageParseError> {
    let msg: MurfServerMessage = serde_json::from_str(text)?;

    let context_id = match msg.context_id {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(ContextId::from(id)),
        Some(other) => return Err(MessageParseError::InvalidContextId(other)),
    };

    if let Some(error) = msg.error {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Ok(ServerEvent::Error {
            context_id,
            message,
        });
    }

    let is_final = msg.is_final == Some(true);

    if let Some(audio) = msg.audio {
        let data = BASE64.decode(audio.as_bytes())?;
        return Ok(ServerEvent::Audio {
            context_id,
            data: Bytes::from(data),
            is_final,
        });
    }

    if is_final {
        return Ok(ServerEvent::Final { context_id });
    }

    Ok(ServerEvent::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tts::murf::config::MurfTtsConfig;
    use serde_json::json;

    fn voice() -> VoiceConfig {
        MurfTtsConfig::new("key").voice_config()
    }

    #[test]
    fn test_text_message_shape() {
        let msg = MurfClientMessage::text(voice(), ContextId::from("ctx-1"), "Hello ", false);
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["context_id"], "ctx-1");
        assert_eq!(value["text"], "Hello ");
        assert_eq!(value["end"], false);
        assert_eq!(value["voice_config"]["voice_id"], "en-UK-ruby");
        assert_eq!(value["voice_config"]["style"], "Conversational");
        assert_eq!(value["voice_config"]["rate"], 0);
        assert_eq!(value["voice_config"]["variation"], 1);
        assert_eq!(value["voice_config"]["pronunciation_dictionary"], json!({}));
        assert!(value["voice_config"].get("multi_native_locale").is_none());
    }

    #[test]
    fn test_end_and_clear_message_shape() {
        let end = MurfClientMessage::end(ContextId::from("c"));
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            json!({"context_id": "c", "end": true})
        );

        let clear = MurfClientMessage::clear(ContextId::from("c"));
        assert!(clear.is_clear());
        assert_eq!(
            serde_json::to_value(&clear).unwrap(),
            json!({"clear": true, "context_id": "c"})
        );
    }

    #[test]
    fn test_pronunciation_serialization() {
        let mut config = voice();
        config
            .pronunciation_dictionary
            .insert("2022".to_string(), Pronunciation::say_as("twenty twenty two"));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(
            value["pronunciation_dictionary"]["2022"],
            json!({"type": "SAY_AS", "pronunciation": "twenty twenty two"})
        );
    }

    #[test]
    fn test_parse_audio() {
        let text = json!({"audio": BASE64.encode([1u8, 2, 3]), "context_id": "ctx"}).to_string();
        match parse_server_message(&text).unwrap() {
            ServerEvent::Audio {
                context_id,
                data,
                is_final,
            } => {
                assert_eq!(context_id, Some(ContextId::from("ctx")));
                assert_eq!(&data[..], &[1, 2, 3]);
                assert!(!is_final);
            }
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_audio_with_final_flag() {
        let text = json!({"audio": BASE64.encode([9u8]), "final": true}).to_string();
        assert!(matches!(
            parse_server_message(&text).unwrap(),
            ServerEvent::Audio { is_final: true, context_id: None, .. }
        ));
    }

    #[test]
    fn test_parse_final() {
        let text = json!({"final": true, "context_id": "ctx"}).to_string();
        assert_eq!(
            parse_server_message(&text).unwrap(),
            ServerEvent::Final {
                context_id: Some(ContextId::from("ctx"))
            }
        );
    }

    #[test]
    fn test_parse_error_string_and_object() {
        let text = json!({"error": "quota exceeded", "context_id": "ctx"}).to_string();
        assert_eq!(
            parse_server_message(&text).unwrap(),
            ServerEvent::Error {
                context_id: Some(ContextId::from("ctx")),
                message: "quota exceeded".to_string()
            }
        );

        let text = json!({"error": {"code": 400}}).to_string();
        match parse_server_message(&text).unwrap() {
            ServerEvent::Error { message, .. } => assert!(message.contains("400")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown() {
        let text = json!({"status": "ok"}).to_string();
        assert_eq!(parse_server_message(&text).unwrap(), ServerEvent::Unknown);

        let text = json!({"final": false}).to_string();
        assert_eq!(parse_server_message(&text).unwrap(), ServerEvent::Unknown);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_server_message("not json"),
            Err(MessageParseError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_server_message(&json!({"audio": "AAA", "context_id": 7}).to_string()),
            Err(MessageParseError::InvalidContextId(_))
        ));
        assert!(matches!(
            parse_server_message(&json!({"audio": "!!not-base64!!"}).to_string()),
            Err(MessageParseError::InvalidAudio(_))
        ));
    }
}
