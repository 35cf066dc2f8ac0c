//! JSON wire messages exchanged with the realtime service.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, VoxlinkError};

/// Inbound event kinds the engine understands.
pub mod kind {
    pub const SESSION_CREATED: &str = "session.created";
    pub const ITEM_CREATED: &str = "conversation.item.created";
    pub const RESPONSE_CREATED: &str = "response.created";
    pub const RESPONSE_DONE: &str = "response.done";
    pub const AUDIO_DELTA: &str = "response.audio.delta";
    pub const AUDIO_DONE: &str = "response.audio.done";
    pub const TRANSCRIPT_DELTA: &str = "response.audio_transcript.delta";
    pub const TRANSCRIPT_DONE: &str = "response.audio_transcript.done";
    pub const CONTENT_PART_ADDED: &str = "response.content_part.added";
    pub const CONTENT_PART_DONE: &str = "response.content_part.done";
    pub const OUTPUT_ITEM_ADDED: &str = "response.output_item.added";
    pub const OUTPUT_ITEM_DONE: &str = "response.output_item.done";
    pub const RATE_LIMITS_UPDATED: &str = "rate_limits.updated";
    pub const ERROR: &str = "error";
}

/// Messages sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseOptions },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// A user message carrying one base64 PCM16 audio part.
    pub fn input_audio(audio_base64: String) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: Role::User,
                content: vec![ContentPart::InputAudio {
                    audio: audio_base64,
                }],
            },
        }
    }

    /// Request an audio + text response.
    pub fn response_create(instructions: &str) -> Self {
        ClientEvent::ResponseCreate {
            response: ResponseOptions {
                modalities: vec![Modality::Audio, Modality::Text],
                instructions: instructions.to_string(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: Role,
        content: Vec<ContentPart>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputAudio { audio: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOptions {
    pub modalities: Vec<Modality>,
    pub instructions: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Audio,
    Text,
}

/// Payload of `response.audio.delta` and `response.audio_transcript.delta`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaPayload {
    #[serde(default)]
    pub delta: String,
}

/// Payload of `error`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    pub message: Option<String>,
    pub code: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ErrorDetail {
    pub fn describe(&self) -> String {
        let message = self.message.as_deref().unwrap_or("unknown error");
        match &self.code {
            Some(code) => format!("{} ({})", message, code),
            None => message.to_string(),
        }
    }
}

/// A parsed inbound message: its `type` plus the whole JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: String,
    pub body: Value,
}

impl InboundMessage {
    /// Parse one complete message.
    ///
    /// # Errors
    /// `Serialization` for invalid JSON, `Protocol` when `type` is missing.
    pub fn parse(text: &str) -> Result<Self> {
        let body: Value = serde_json::from_str(text)?;
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| VoxlinkError::Protocol {
                message: "message has no \"type\" field".to_string(),
            })?
            .to_string();
        Ok(Self { kind, body })
    }

    /// Deserialize the body into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.body)?)
    }
}

/// One frame off the wire. Data frames may be fragments of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Data { payload: Vec<u8>, fin: bool },
    Close,
}

impl WireFrame {
    /// A complete single-frame text message.
    pub fn text(text: impl Into<String>) -> Self {
        WireFrame::Data {
            payload: text.into().into_bytes(),
            fin: true,
        }
    }
}

/// Joins fragments until the final one, then yields the full message text.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment. Returns the complete message once `fin` is seen;
    /// blank messages are swallowed.
    pub fn push(&mut self, fragment: &[u8], fin: bool) -> Option<Result<String>> {
        self.buffer.extend_from_slice(fragment);
        if !fin {
            return None;
        }
        let bytes = std::mem::take(&mut self.buffer);
        match String::from_utf8(bytes) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(Ok(text)),
            Err(e) => Some(Err(VoxlinkError::Protocol {
                message: format!("message is not valid UTF-8: {}", e),
            })),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_create_wire_shape() {
        let event = ClientEvent::input_audio("AAAA".to_string());
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{"type": "input_audio", "audio": "AAAA"}]
                }
            })
        );
    }

    #[test]
    fn test_response_create_wire_shape() {
        let event = ClientEvent::response_create("Please provide a transcript.");
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "response.create",
                "response": {
                    "modalities": ["audio", "text"],
                    "instructions": "Please provide a transcript."
                }
            })
        );
    }

    #[test]
    fn test_response_cancel_wire_shape() {
        assert_eq!(
            ClientEvent::ResponseCancel.to_json().unwrap(),
            r#"{"type":"response.cancel"}"#
        );
    }

    #[test]
    fn test_kind_matches_serialized_type() {
        for event in [
            ClientEvent::input_audio(String::new()),
            ClientEvent::response_create(""),
            ClientEvent::ResponseCancel,
        ] {
            let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn test_parse_inbound_kind() {
        let message = InboundMessage::parse(r#"{"type":"response.audio.delta","delta":"AAA="}"#)
            .unwrap();
        assert_eq!(message.kind, kind::AUDIO_DELTA);
        let payload: DeltaPayload = message.payload().unwrap();
        assert_eq!(payload.delta, "AAA=");
    }

    #[test]
    fn test_parse_rejects_missing_type() {
        assert!(matches!(
            InboundMessage::parse(r#"{"delta":"x"}"#),
            Err(VoxlinkError::Protocol { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            InboundMessage::parse("{not json"),
            Err(VoxlinkError::Serialization(_))
        ));
    }

    #[test]
    fn test_error_payload_description() {
        let message = InboundMessage::parse(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"bad_audio","message":"Audio too short"}}"#,
        )
        .unwrap();
        let payload: ErrorPayload = message.payload().unwrap();
        assert_eq!(payload.error.describe(), "Audio too short (bad_audio)");
        assert_eq!(payload.error.kind.as_deref(), Some("invalid_request_error"));
    }

    #[test]
    fn test_error_payload_without_details() {
        let payload: ErrorPayload = InboundMessage::parse(r#"{"type":"error"}"#)
            .unwrap()
            .payload()
            .unwrap();
        assert_eq!(payload.error.describe(), "unknown error");
    }

    #[test]
    fn test_assembler_joins_fragments() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(br#"{"type":"#, false).is_none());
        assert!(assembler.push(br#""session"#, false).is_none());
        let text = assembler.push(br#".created"}"#, true).unwrap().unwrap();
        assert_eq!(text, r#"{"type":"session.created"}"#);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_assembler_skips_blank_messages() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(b"  \n", true).is_none());
    }

    #[test]
    fn test_assembler_reports_invalid_utf8_and_recovers() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(&[0xff, 0xfe], true).unwrap().is_err());
        let text = assembler.push(b"{}", true).unwrap().unwrap();
        assert_eq!(text, "{}");
    }
}
