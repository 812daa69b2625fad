//! Per-conversation model sessions owned by the worker context.
//!
//! A session is created on the first message for a key and lives until it is
//! deleted or the worker instance goes away. Sessions are never serialized;
//! a recreated worker starts empty and sessions are rebuilt lazily.
//!
//! Features:
//! - Streaming loop with incremental/cumulative chunk reconciliation
//! - Quota check before any work and every N chunks while streaming
//! - Media validation before anything reaches the model
//! - Only successful first generations are kept

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::ImageFormat;
use parking_lot::Mutex;
use providers::{
    ContentPart, ImageInput, LanguageModel, ModelSession, PromptInput, PromptTurn, ProviderError,
    SessionOptions,
};
use shared::error::GenerationError;
use shared::ids::ConversationKey;
use shared::protocol::{ConversationTurn, CreateSessionRequest, MediaPayload};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

/// Reconcile one streamed chunk into the accumulated buffer.
///
/// Providers differ in whether chunks carry the delta or everything so far.
/// A chunk that starts with the whole buffer is taken to be cumulative and
/// replaces it; anything else is appended.
pub fn merge_chunk(buffer: &mut String, chunk: &str) {
    if chunk.starts_with(buffer.as_str()) {
        buffer.clear();
    }
    buffer.push_str(chunk);
}

struct Session {
    handle: Box<dyn ModelSession>,
    language: String,
}

pub struct SessionStore {
    model: Arc<dyn LanguageModel>,
    sessions: Mutex<HashMap<ConversationKey, Arc<tokio::sync::Mutex<Session>>>>,
    quota_check_interval: usize,
}

impl SessionStore {
    pub fn new(model: Arc<dyn LanguageModel>, quota_check_interval: usize) -> Self {
        Self {
            model,
            sessions: Mutex::new(HashMap::new()),
            quota_check_interval: quota_check_interval.max(1),
        }
    }

    pub fn has_session(&self, key: ConversationKey) -> bool {
        self.sessions.lock().contains_key(&key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Language the session for `key` was configured with
    pub async fn language(&self, key: ConversationKey) -> Option<String> {
        let session = self.sessions.lock().get(&key).cloned()?;
        let language = session.lock().await.language.clone();
        Some(language)
    }

    /// Start a conversation and stream its first answer.
    ///
    /// Any existing session for the key is dropped first. The new one is
    /// stored only if the first generation succeeds.
    pub async fn create_session<F>(
        &self,
        request: &CreateSessionRequest,
        mut on_update: F,
    ) -> Result<String, GenerationError>
    where
        F: FnMut(&str) + Send,
    {
        let key = request.key;
        if self.sessions.lock().remove(&key).is_some() {
            debug!(%key, "replacing existing session");
        }

        let input = build_initial_input(request)?;

        let handle = self
            .model
            .create_session(SessionOptions::multimodal(request.language.clone()))
            .await
            .map_err(|e| match e {
                ProviderError::Unavailable(_) => GenerationError::LanguageModelUnavailable,
                other => GenerationError::LanguageModelCreationFailed(other.to_string()),
            })?;
        let mut session = Session {
            handle,
            language: request.language.clone(),
        };

        check_quota(session.handle.as_ref())?;
        let text = run_stream(
            session.handle.as_mut(),
            input,
            self.quota_check_interval,
            &mut on_update,
        )
        .await?;

        self.sessions
            .lock()
            .insert(key, Arc::new(tokio::sync::Mutex::new(session)));
        info!(%key, chars = text.len(), "session created");
        Ok(text)
    }

    /// Send a follow-up turn to an existing session.
    ///
    /// Text-only turns go to the model as a plain string; turns with media
    /// go as a structured turn.
    pub async fn continue_session<F>(
        &self,
        key: ConversationKey,
        turn: &ConversationTurn,
        mut on_update: F,
    ) -> Result<String, GenerationError>
    where
        F: FnMut(&str) + Send,
    {
        let session = self
            .sessions
            .lock()
            .get(&key)
            .cloned()
            .ok_or(GenerationError::SessionNotFound(key))?;

        let input = if turn.has_media() {
            PromptInput::Turns(vec![to_prompt_turn(turn)?])
        } else {
            PromptInput::Text(turn.text.clone())
        };

        // Serializes generations for this key only
        let mut session = session.lock().await;
        check_quota(session.handle.as_ref())?;
        run_stream(
            session.handle.as_mut(),
            input,
            self.quota_check_interval,
            &mut on_update,
        )
        .await
    }

    /// Returns whether a session existed
    pub fn delete_session(&self, key: ConversationKey) -> bool {
        let existed = self.sessions.lock().remove(&key).is_some();
        if existed {
            info!(%key, "session deleted");
        }
        existed
    }
}

fn check_quota(handle: &dyn ModelSession) -> Result<(), GenerationError> {
    let usage = handle.quota().snapshot();
    if usage.is_exceeded() {
        return Err(GenerationError::QuotaExceeded {
            usage: usage.usage,
            limit: usage.limit,
            partial: None,
        });
    }
    Ok(())
}

async fn run_stream(
    handle: &mut dyn ModelSession,
    input: PromptInput,
    quota_check_interval: usize,
    on_update: &mut (dyn FnMut(&str) + Send),
) -> Result<String, GenerationError> {
    let quota = handle.quota();
    let (tx, mut rx) = unbounded_channel::<String>();
    let producer = handle.prompt_streaming(input, tx);
    tokio::pin!(producer);

    let mut buffer = String::new();
    let mut chunks = 0usize;
    let mut outcome = None;

    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                merge_chunk(&mut buffer, &chunk);
                on_update(&buffer);
                chunks += 1;

                if chunks % quota_check_interval == 0 {
                    let usage = quota.snapshot();
                    if usage.is_exceeded() {
                        warn!(chunks, usage = usage.usage, limit = usage.limit, "quota exceeded mid-stream");
                        return Err(GenerationError::QuotaExceeded {
                            usage: usage.usage,
                            limit: usage.limit,
                            partial: Some(buffer),
                        });
                    }
                }
            }
            result = &mut producer, if outcome.is_none() => {
                outcome = Some(result);
            }
        }
    }

    let result = match outcome {
        Some(result) => result,
        None => producer.await,
    };
    result.map_err(map_provider_error)?;

    debug!(chunks, chars = buffer.len(), "generation finished");
    Ok(buffer)
}

fn map_provider_error(err: ProviderError) -> GenerationError {
    match err {
        ProviderError::Unavailable(_) => GenerationError::LanguageModelUnavailable,
        ProviderError::Network(msg) => GenerationError::NetworkError(msg),
        ProviderError::InvalidImage(msg) => GenerationError::ImageProcessingError(msg),
        ProviderError::Creation(msg) => GenerationError::LanguageModelCreationFailed(msg),
        ProviderError::Other(msg) => GenerationError::Generic(msg),
    }
}

fn build_initial_input(request: &CreateSessionRequest) -> Result<PromptInput, GenerationError> {
    let mut content = vec![ContentPart::Text(request.initial_prompt.clone())];
    if let Some(media) = &request.media {
        content.push(ContentPart::Image(decode_media(media)?));
    }
    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        content.push(ContentPart::Text(format!("Page context:\n{}", context)));
    }

    let mut turns = vec![PromptTurn {
        role: shared::protocol::TurnRole::User,
        content,
    }];
    for turn in &request.extra_turns {
        turns.push(to_prompt_turn(turn)?);
    }
    Ok(PromptInput::Turns(turns))
}

fn to_prompt_turn(turn: &ConversationTurn) -> Result<PromptTurn, GenerationError> {
    let mut content = vec![ContentPart::Text(turn.text.clone())];
    if let Some(media) = &turn.media {
        content.push(ContentPart::Image(decode_media(media)?));
    }
    Ok(PromptTurn {
        role: turn.role,
        content,
    })
}

/// Mime type of an image the model accepts, judged from its content
pub fn sniff_image_mime(bytes: &[u8]) -> Result<&'static str, GenerationError> {
    let format = image::guess_format(bytes)
        .map_err(|e| GenerationError::ImageProcessingError(e.to_string()))?;
    match format {
        ImageFormat::Png => Ok("image/png"),
        ImageFormat::Jpeg => Ok("image/jpeg"),
        ImageFormat::Gif => Ok("image/gif"),
        ImageFormat::WebP => Ok("image/webp"),
        ImageFormat::Bmp => Ok("image/bmp"),
        other => Err(GenerationError::ImageProcessingError(format!(
            "unsupported image format {:?}",
            other
        ))),
    }
}

/// Decode base64 media and make sure it is an image we recognise
fn decode_media(media: &MediaPayload) -> Result<ImageInput, GenerationError> {
    // Tolerate data URLs from capture APIs
    let data = match media.data.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => media.data.as_str(),
    };
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| GenerationError::ImageProcessingError(format!("invalid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(GenerationError::ImageProcessingError("empty image".into()));
    }

    let sniffed = sniff_image_mime(&bytes)?;
    if !media.mime_type.is_empty() && media.mime_type != sniffed {
        debug!(declared = %media.mime_type, sniffed, "image mime type mismatch, using sniffed");
    }

    Ok(ImageInput {
        mime_type: sniffed.to_string(),
        bytes,
    })
}
