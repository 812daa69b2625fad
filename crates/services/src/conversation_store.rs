//! Durable conversation records
//!
//! Every analysed page or image gets one record. The coordinator writes the
//! initial answer, the generated title and suggested questions, and each
//! follow-up exchange. Records outlive the worker context, which is what
//! makes a conversation resumable after the host tears the worker down.
//!
//! Features:
//! - `ConversationStore` trait so the coordinator never cares where records live
//! - In-memory store for tests and ephemeral runs
//! - One-JSON-file-per-record directory store
//! - Archive listing and simple keyword search

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use shared::ids::ConversationKey;
use shared::protocol::{CaptureKind, ConversationTurn, TurnRole};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One exchanged message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A persisted conversation about one page or image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub key: ConversationKey,
    pub kind: CaptureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub initial_prompt: String,
    /// Packed page context sent with the first prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    /// Suggested follow-up questions
    #[serde(default)]
    pub actions: Vec<String>,
    /// Set once title and actions are in; cleared when the tab goes away
    #[serde(default)]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(key: ConversationKey, kind: CaptureKind, initial_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            key,
            kind,
            url: None,
            title: None,
            initial_prompt: initial_prompt.into(),
            context: None,
            messages: Vec::new(),
            actions: Vec::new(),
            active: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_message(&mut self, role: TurnRole, text: impl Into<String>) {
        self.messages.push(ConversationMessage::new(role, text));
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Messages as protocol turns, replayed after the initial prompt when a
    /// worker session is rebuilt.
    pub fn replay_turns(&self) -> Vec<ConversationTurn> {
        self.messages
            .iter()
            .map(|m| ConversationTurn {
                role: m.role,
                text: m.text.clone(),
                media: None,
            })
            .collect()
    }

    fn filename(&self) -> String {
        format!("{}.json", self.id)
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ConversationRecord>>;

    /// All records, most recently updated first
    async fn list(&self) -> Result<Vec<ConversationRecord>>;

    async fn put(&self, record: &ConversationRecord) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Inactive conversations, most recent first
pub async fn list_archived(store: &dyn ConversationStore) -> Result<Vec<ConversationRecord>> {
    Ok(store.list().await?.into_iter().filter(|r| !r.active).collect())
}

/// A keyword hit inside a stored conversation
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record_id: String,
    pub title: Option<String>,
    pub message_index: usize,
    pub snippet: String,
}

/// Case-insensitive keyword search over all message text
pub async fn search(store: &dyn ConversationStore, query: &str) -> Result<Vec<SearchHit>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let needle = RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .context("building search pattern")?;

    let mut hits = Vec::new();
    for record in store.list().await? {
        for (i, msg) in record.messages.iter().enumerate() {
            // Offsets come from the text itself, case folding can change byte lengths
            if let Some(found) = needle.find(&msg.text) {
                hits.push(SearchHit {
                    record_id: record.id.clone(),
                    title: record.title.clone(),
                    message_index: i,
                    snippet: snippet_around(&msg.text, found.start(), found.len()),
                });
            }
        }
    }
    Ok(hits)
}

fn snippet_around(text: &str, pos: usize, len: usize) -> String {
    const PAD: usize = 40;
    let mut start = pos.saturating_sub(PAD);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (pos + len + PAD).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(text[start..end].trim());
    if end < text.len() {
        snippet.push_str("...");
    }
    snippet
}

fn sort_recent_first(records: &mut [ConversationRecord]) {
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    records: RwLock<HashMap<String, ConversationRecord>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, id: &str) -> Result<Option<ConversationRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ConversationRecord>> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        sort_recent_first(&mut records);
        Ok(records)
    }

    async fn put(&self, record: &ConversationRecord) -> Result<()> {
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().remove(id);
        Ok(())
    }
}

/// Stores each record as `<dir>/<id>.json`
pub struct JsonDirConversationStore {
    dir: PathBuf,
}

impl JsonDirConversationStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating conversation dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl ConversationStore for JsonDirConversationStore {
    async fn get(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let record = serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn list(&self) -> Result<Vec<ConversationRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // A half-written or foreign file should not hide the rest
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<ConversationRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable record: {}", e),
            }
        }

        sort_recent_first(&mut records);
        Ok(records)
    }

    async fn put(&self, record: &ConversationRecord) -> Result<()> {
        let path = self.dir.join(record.filename());
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
