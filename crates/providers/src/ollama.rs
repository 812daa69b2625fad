use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use shared::protocol::TurnRole;
use shared::settings::ModelSettings;
use std::env;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::{
    estimate_tokens, Availability, ContentPart, LanguageModel, ModelSession, PromptInput,
    ProviderError, QuotaMeter, SessionOptions,
};

static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .pool_max_idle_per_host(2)
        .build()
        .unwrap_or_else(|_| Client::new())
});

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [OllamaMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_ctx: u64,
}

/// Streaming response: each line is one of these JSON objects.
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
}

/// A locally served Ollama model with vision support
pub struct OllamaModel {
    http: Client,
    base: String,
    model: String,
    context_window: u64,
}

impl OllamaModel {
    pub fn new(settings: &ModelSettings) -> Self {
        let base = env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| settings.ollama_base_url.clone());
        Self {
            http: SHARED_HTTP.clone(),
            base,
            model: settings.model.clone(),
            context_window: settings.context_window,
        }
    }

    fn model_matches(&self, tag: &str) -> bool {
        // `ollama list` shows "llava" as "llava:latest"
        tag == self.model || tag.split(':').next() == Some(self.model.as_str())
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn availability(&self) -> Availability {
        let url = format!("{}/api/tags", self.base);
        let resp = match self.http.get(url).timeout(Duration::from_secs(2)).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return Availability::Unavailable,
        };
        match resp.json::<OllamaTags>().await {
            Ok(tags) if tags.models.iter().any(|t| self.model_matches(&t.name)) => {
                Availability::Available
            }
            Ok(_) => Availability::Downloadable,
            Err(_) => Availability::Unavailable,
        }
    }

    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Box<dyn ModelSession>, ProviderError> {
        match self.availability().await {
            Availability::Available => {}
            Availability::Downloadable => {
                return Err(ProviderError::Unavailable(format!(
                    "model {} has not been pulled yet",
                    self.model
                )))
            }
            Availability::Unavailable => {
                return Err(ProviderError::Unavailable(format!(
                    "no Ollama server reachable at {}",
                    self.base
                )))
            }
        }

        let system = OllamaMessage {
            role: "system".to_string(),
            content: format!(
                "You describe web pages and images for the user. Always answer in the language with tag \"{}\".",
                options.language
            ),
            images: Vec::new(),
        };
        let meter = QuotaMeter::new(self.context_window);
        meter.set(estimate_tokens(&system.content));

        Ok(Box::new(OllamaSession {
            http: self.http.clone(),
            base: self.base.clone(),
            model: self.model.clone(),
            context_window: self.context_window,
            history: vec![system],
            meter,
        }))
    }
}

pub struct OllamaSession {
    http: Client,
    base: String,
    model: String,
    context_window: u64,
    history: Vec<OllamaMessage>,
    meter: QuotaMeter,
}

fn to_messages(input: PromptInput) -> Vec<OllamaMessage> {
    match input {
        PromptInput::Text(text) => vec![OllamaMessage {
            role: "user".to_string(),
            content: text,
            images: Vec::new(),
        }],
        PromptInput::Turns(turns) => turns
            .into_iter()
            .map(|turn| {
                let mut content = Vec::new();
                let mut images = Vec::new();
                for part in turn.content {
                    match part {
                        ContentPart::Text(text) => content.push(text),
                        ContentPart::Image(image) => images.push(STANDARD.encode(&image.bytes)),
                    }
                }
                OllamaMessage {
                    role: match turn.role {
                        TurnRole::User => "user",
                        TurnRole::Assistant => "assistant",
                    }
                    .to_string(),
                    content: content.join("\n\n"),
                    images,
                }
            })
            .collect(),
    }
}

#[async_trait]
impl ModelSession for OllamaSession {
    async fn prompt_streaming(
        &mut self,
        input: PromptInput,
        tx: UnboundedSender<String>,
    ) -> Result<(), ProviderError> {
        let mut conversation = self.history.clone();
        conversation.extend(to_messages(input));

        // Ollama only reports exact counts on the final line, so estimate
        // until then.
        let estimated: u64 = conversation.iter().map(|m| estimate_tokens(&m.content)).sum();
        self.meter.set(estimated);

        let url = format!("{}/api/chat", self.base);
        debug!(model = %self.model, messages = conversation.len(), estimated, "ollama chat request");
        let req = OllamaChatRequest {
            model: &self.model,
            messages: &conversation,
            stream: true,
            options: OllamaOptions {
                num_ctx: self.context_window,
            },
        };
        let resp = self
            .http
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(ProviderError::Unavailable(format!("model {} not found", self.model)))
            }
            status => {
                warn!(%status, "ollama rejected chat request");
                return Err(ProviderError::Other(format!("ollama error: {}", status)));
            }
        }

        // Ollama streams line-delimited JSON
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut reply = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Network(format!("stream read error: {}", e)))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));

            // Process complete lines
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf = buf[pos + 1..].to_string();

                if line.is_empty() {
                    continue;
                }

                let chunk_data = serde_json::from_str::<OllamaStreamChunk>(&line).map_err(|e| {
                    ProviderError::Other(format!("Failed to parse Ollama stream: {}", e))
                })?;
                if let Some(error) = chunk_data.error {
                    return Err(ProviderError::Other(error));
                }
                if let Some(msg) = &chunk_data.message {
                    if !msg.content.is_empty() {
                        reply.push_str(&msg.content);
                        self.meter.add(1);
                        if tx.send(msg.content.clone()).is_err() {
                            // Receiver gone: nobody wants the rest.
                            return Ok(());
                        }
                    }
                }
                if chunk_data.done {
                    if let (Some(prompt), Some(eval)) =
                        (chunk_data.prompt_eval_count, chunk_data.eval_count)
                    {
                        self.meter.set(prompt + eval);
                        debug!(prompt, eval, "ollama generation done");
                    }
                    self.history = conversation;
                    self.history.push(OllamaMessage {
                        role: "assistant".to_string(),
                        content: reply,
                        images: Vec::new(),
                    });
                    return Ok(());
                }
            }
        }

        Err(ProviderError::Network(
            "Ollama stream ended without a final chunk".to_string(),
        ))
    }

    fn quota(&self) -> QuotaMeter {
        self.meter.clone()
    }
}
