//! Generation phase and stream buffer per conversation key.

use serde::Serialize;
use shared::ids::ConversationKey;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationPhase {
    Idle,
    StreamingInitial,
    /// Title and suggested questions, generated as a synthetic follow-up
    StreamingMeta,
    StreamingFollowup,
}

impl ConversationPhase {
    pub fn is_streaming(self) -> bool {
        self != ConversationPhase::Idle
    }

    pub fn is_followup(self) -> bool {
        matches!(
            self,
            ConversationPhase::StreamingFollowup | ConversationPhase::StreamingMeta
        )
    }
}

#[derive(Debug)]
struct Entry {
    phase: ConversationPhase,
    buffer: String,
}

/// Phase table. The buffer of a key is cleared whenever it returns to idle.
#[derive(Debug, Default)]
pub struct PhaseTable {
    entries: HashMap<ConversationKey, Entry>,
}

impl PhaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when nothing was ever recorded for the key
    pub fn phase(&self, key: ConversationKey) -> Option<ConversationPhase> {
        self.entries.get(&key).map(|e| e.phase)
    }

    /// Move an idle (or unknown) key into `phase`. Fails with the current
    /// phase if a generation is already in flight.
    pub fn try_begin(
        &mut self,
        key: ConversationKey,
        phase: ConversationPhase,
    ) -> Result<(), ConversationPhase> {
        match self.phase(key) {
            Some(current) if current.is_streaming() => Err(current),
            _ => {
                self.transition(key, phase);
                Ok(())
            }
        }
    }

    pub fn transition(&mut self, key: ConversationKey, phase: ConversationPhase) {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            phase,
            buffer: String::new(),
        });
        entry.phase = phase;
        if phase == ConversationPhase::Idle {
            entry.buffer.clear();
        }
    }

    pub fn set_buffer(&mut self, key: ConversationKey, text: &str) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.buffer.clear();
            entry.buffer.push_str(text);
        }
    }

    pub fn buffer(&self, key: ConversationKey) -> Option<&str> {
        self.entries.get(&key).map(|e| e.buffer.as_str())
    }

    pub fn remove(&mut self, key: ConversationKey) {
        self.entries.remove(&key);
    }
}
