//! Fan-out of normalized stream events to UI surfaces.
//!
//! Any number of surfaces may listen; one that attaches late asks the
//! coordinator for a snapshot and then follows the bus.

use serde::Serialize;
use shared::error::GenerationErrorKind;
use shared::ids::ConversationKey;
use tokio::sync::broadcast;

const UI_QUEUE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum UiEvent {
    #[serde(rename_all = "camelCase")]
    StreamUpdate {
        key: ConversationKey,
        text: String,
        is_followup: bool,
        is_meta: bool,
    },
    #[serde(rename_all = "camelCase")]
    StreamComplete {
        key: ConversationKey,
        text: String,
        is_followup: bool,
        is_meta: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<GenerationErrorKind>,
    },
    /// Title and suggested questions are ready
    ConversationMeta {
        key: ConversationKey,
        title: Option<String>,
        actions: Vec<String>,
    },
}

impl UiEvent {
    pub fn key(&self) -> ConversationKey {
        match self {
            UiEvent::StreamUpdate { key, .. }
            | UiEvent::StreamComplete { key, .. }
            | UiEvent::ConversationMeta { key, .. } => *key,
        }
    }
}

#[derive(Clone)]
pub struct UiBus {
    tx: broadcast::Sender<UiEvent>,
}

impl Default for UiBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UiBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UI_QUEUE);
        Self { tx }
    }

    /// Nobody listening is fine
    pub fn publish(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}
