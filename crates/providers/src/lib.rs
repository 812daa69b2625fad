//! On-device language model providers.
//!
//! The worker context talks to a model only through [`LanguageModel`] and
//! [`ModelSession`]. A session streams chunks into a channel; whether a
//! chunk is incremental or the whole text so far is up to the provider.

pub mod ollama;
pub mod scripted;

use async_trait::async_trait;
use shared::protocol::TurnRole;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Whether the model can be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Runtime is up but the model still has to be pulled
    Downloadable,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Image,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub language: String,
    pub expected_inputs: Vec<Modality>,
    pub expected_outputs: Vec<Modality>,
}

impl SessionOptions {
    /// Text + image in, text out, answering in `language`
    pub fn multimodal(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            expected_inputs: vec![Modality::Text, Modality::Image],
            expected_outputs: vec![Modality::Text],
        }
    }
}

/// Decoded image bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image(ImageInput),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTurn {
    pub role: TurnRole,
    pub content: Vec<ContentPart>,
}

impl PromptTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: vec![ContentPart::Text(text.into())],
        }
    }
}

/// What a single prompt call receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    /// Simple follow-up: a bare string
    Text(String),
    /// Structured multi-part turns
    Turns(Vec<PromptTurn>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("session creation failed: {0}")]
    Creation(String),

    #[error("{0}")]
    Other(String),
}

/// Usage against a session's input quota, as last reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub usage: u64,
    pub limit: u64,
}

impl QuotaUsage {
    pub fn is_exceeded(&self) -> bool {
        self.usage >= self.limit
    }
}

/// Shared view of a session's quota counters.
///
/// The provider updates it while streaming; the session store reads it
/// between chunks without borrowing the session.
#[derive(Debug, Clone)]
pub struct QuotaMeter {
    usage: Arc<AtomicU64>,
    limit: u64,
}

impl QuotaMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            usage: Arc::new(AtomicU64::new(0)),
            limit,
        }
    }

    pub fn add(&self, tokens: u64) {
        self.usage.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn set(&self, tokens: u64) {
        self.usage.store(tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QuotaUsage {
        QuotaUsage {
            usage: self.usage.load(Ordering::Relaxed),
            limit: self.limit,
        }
    }
}

/// Estimate tokens for text (rough approximation: 4 chars ≈ 1 token)
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn availability(&self) -> Availability;

    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Box<dyn ModelSession>, ProviderError>;
}

#[async_trait]
pub trait ModelSession: Send {
    /// Run one prompt and push output chunks into `tx` until generation ends.
    ///
    /// Returns `Ok(())` once the last chunk has been sent. Dropping the
    /// returned future abandons the generation.
    async fn prompt_streaming(
        &mut self,
        input: PromptInput,
        tx: UnboundedSender<String>,
    ) -> Result<(), ProviderError>;

    fn quota(&self) -> QuotaMeter;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_meter_is_shared_between_clones() {
        let meter = QuotaMeter::new(100);
        let reader = meter.clone();

        meter.add(60);
        assert!(!reader.snapshot().is_exceeded());
        meter.add(40);
        assert!(reader.snapshot().is_exceeded());

        meter.set(10);
        assert_eq!(reader.snapshot(), QuotaUsage { usage: 10, limit: 100 });
    }

    #[test]
    fn test_token_estimation() {
        assert_eq!(estimate_tokens("12345678"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
