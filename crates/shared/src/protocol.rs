//! Messages exchanged between the coordinator, the worker context and UI
//! surfaces.
//!
//! Every message is a loosely-typed record discriminated by an `action`
//! field, so the JSON shape matches what the browser host puts on its
//! message bus.

use serde::{Deserialize, Serialize};

use crate::error::GenerationErrorKind;
use crate::ids::ConversationKey;

/// What the media attached to a new session depicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Visible area of a web page
    Screenshot,
    /// A single image the user picked on a page
    Image,
}

/// Base64-encoded image bytes plus their mime type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPayload {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// A single conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            media: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: MediaPayload) -> Self {
        self.media = Some(media);
        self
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub key: ConversationKey,
    #[serde(rename = "type")]
    pub kind: CaptureKind,
    pub initial_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
    /// Page context text, already packed under the context budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub language: String,
    /// Turns replayed after the initial prompt when rebuilding a session
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_turns: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPromptRequest {
    pub key: ConversationKey,
    pub turn: ConversationTurn,
}

/// How the delivery layer has to wait for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Single round trip, the reply is the answer
    AwaitAck,
    /// The reply only acknowledges that generation started
    Stream,
}

/// Coordinator → worker requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum WorkerRequest {
    Ping,
    CreateSession(CreateSessionRequest),
    SendPrompt(SendPromptRequest),
    DeleteSession { key: ConversationKey },
}

impl WorkerRequest {
    pub fn key(&self) -> Option<ConversationKey> {
        match self {
            WorkerRequest::Ping => None,
            WorkerRequest::CreateSession(req) => Some(req.key),
            WorkerRequest::SendPrompt(req) => Some(req.key),
            WorkerRequest::DeleteSession { key } => Some(*key),
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        match self {
            WorkerRequest::CreateSession(_) | WorkerRequest::SendPrompt(_) => DeliveryMode::Stream,
            WorkerRequest::Ping | WorkerRequest::DeleteSession { .. } => DeliveryMode::AwaitAck,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            WorkerRequest::Ping => "ping",
            WorkerRequest::CreateSession(_) => "createSession",
            WorkerRequest::SendPrompt(_) => "sendPrompt",
            WorkerRequest::DeleteSession { .. } => "deleteSession",
        }
    }
}

/// Direct reply to a [`WorkerRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub success: bool,
    #[serde(default)]
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            started: false,
            error: None,
        }
    }

    pub fn started() -> Self {
        Self {
            success: true,
            started: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            started: false,
            error: Some(error.into()),
        }
    }
}

/// Worker → coordinator → UI stream events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// Cumulative text generated so far
    StreamUpdate { key: ConversationKey, text: String },
    /// Final text. Always the last event of a generation.
    StreamComplete {
        key: ConversationKey,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<GenerationErrorKind>,
    },
}

impl WorkerEvent {
    pub fn key(&self) -> ConversationKey {
        match self {
            WorkerEvent::StreamUpdate { key, .. } | WorkerEvent::StreamComplete { key, .. } => *key,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            WorkerEvent::StreamUpdate { text, .. } | WorkerEvent::StreamComplete { text, .. } => {
                text
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, WorkerEvent::StreamComplete { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_session_wire_shape() {
        let request = WorkerRequest::CreateSession(CreateSessionRequest {
            key: ConversationKey::new(7),
            kind: CaptureKind::Screenshot,
            initial_prompt: "Describe this page".into(),
            media: Some(MediaPayload {
                data: "aGk=".into(),
                mime_type: "image/png".into(),
            }),
            context: None,
            language: "en".into(),
            extra_turns: vec![],
        });

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["action"], "createSession");
        assert_eq!(value["key"], 7);
        assert_eq!(value["type"], "screenshot");
        assert_eq!(value["initialPrompt"], "Describe this page");
        assert_eq!(value["media"]["mimeType"], "image/png");
        assert!(value.get("extraTurns").is_none());
    }

    #[test]
    fn test_parses_host_messages() {
        let ping: WorkerRequest = serde_json::from_value(json!({"action": "ping"})).unwrap();
        assert_eq!(ping, WorkerRequest::Ping);
        assert_eq!(ping.delivery_mode(), DeliveryMode::AwaitAck);

        let delete: WorkerRequest =
            serde_json::from_value(json!({"action": "deleteSession", "key": 3})).unwrap();
        assert_eq!(delete.key(), Some(ConversationKey::new(3)));

        let update: WorkerEvent =
            serde_json::from_value(json!({"action": "streamUpdate", "key": 3, "text": "Desc"}))
                .unwrap();
        assert_eq!(update.text(), "Desc");
        assert!(!update.is_complete());
    }

    #[test]
    fn test_stream_complete_carries_error_kind() {
        let event = WorkerEvent::StreamComplete {
            key: ConversationKey::new(1),
            text: "partial".into(),
            error: Some(GenerationErrorKind::QuotaExceeded),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "streamComplete");
        assert_eq!(value["error"], "quotaExceeded");
    }
}
