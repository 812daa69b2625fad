//! Deterministic provider for tests and offline demos.
//!
//! Each prompt call pops the next [`Script`] and replays its chunks. When the
//! queue is empty a short fixed reply is streamed instead.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    Availability, LanguageModel, ModelSession, PromptInput, ProviderError, QuotaMeter,
    SessionOptions,
};

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub chunks: Vec<String>,
    /// Quota units charged per streamed chunk
    pub usage_per_chunk: u64,
    /// Fail after the chunks have been sent
    pub fail_with: Option<ProviderError>,
    pub chunk_delay: Option<Duration>,
}

impl Script {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn charging(mut self, usage_per_chunk: u64) -> Self {
        self.usage_per_chunk = usage_per_chunk;
        self
    }

    pub fn failing(mut self, error: ProviderError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn paced(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct ScriptedState {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<PromptInput>>,
    sessions_created: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedModel {
    availability: Availability,
    create_error: Option<ProviderError>,
    quota_limit: u64,
    initial_usage: u64,
    state: Arc<ScriptedState>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            availability: Availability::Available,
            create_error: None,
            quota_limit: u64::MAX,
            initial_usage: 0,
            state: Arc::new(ScriptedState::default()),
        }
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_create_error(mut self, error: ProviderError) -> Self {
        self.create_error = Some(error);
        self
    }

    pub fn with_quota(mut self, initial_usage: u64, limit: u64) -> Self {
        self.initial_usage = initial_usage;
        self.quota_limit = limit;
        self
    }

    pub fn push_script(&self, script: Script) {
        self.state.scripts.lock().push_back(script);
    }

    /// Every prompt input received so far, across all sessions
    pub fn prompts(&self) -> Vec<PromptInput> {
        self.state.prompts.lock().clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.state.sessions_created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn availability(&self) -> Availability {
        self.availability
    }

    async fn create_session(
        &self,
        _options: SessionOptions,
    ) -> Result<Box<dyn ModelSession>, ProviderError> {
        if self.availability == Availability::Unavailable {
            return Err(ProviderError::Unavailable("scripted model disabled".into()));
        }
        if let Some(err) = &self.create_error {
            return Err(err.clone());
        }
        self.state.sessions_created.fetch_add(1, Ordering::Relaxed);
        let meter = QuotaMeter::new(self.quota_limit);
        meter.set(self.initial_usage);
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            meter,
        }))
    }
}

struct ScriptedSession {
    state: Arc<ScriptedState>,
    meter: QuotaMeter,
}

#[async_trait]
impl ModelSession for ScriptedSession {
    async fn prompt_streaming(
        &mut self,
        input: PromptInput,
        tx: UnboundedSender<String>,
    ) -> Result<(), ProviderError> {
        self.state.prompts.lock().push(input);
        let script = self
            .state
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::chunks(["OK"]));

        for chunk in script.chunks {
            if let Some(delay) = script.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            self.meter.add(script.usage_per_chunk);
            if tx.send(chunk).is_err() {
                return Ok(());
            }
        }

        match script.fail_with {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn quota(&self) -> QuotaMeter {
        self.meter.clone()
    }
}
