//! Wiring of worker host, coordinator and conversation store, plus the
//! helper that follows one turn on the UI bus.

use anyhow::{bail, Result};
use coordinator::{StreamCoordinator, UiEvent};
use providers::LanguageModel;
use services::ConversationStore;
use session_host::InProcessWorkerHost;
use shared::error::GenerationErrorKind;
use shared::ids::ConversationKey;
use shared::settings::AppSettings;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Pipeline {
    pub coordinator: StreamCoordinator,
    pub store: Arc<dyn ConversationStore>,
    event_loop: JoinHandle<()>,
}

impl Pipeline {
    pub fn start(
        settings: AppSettings,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let host = Arc::new(InProcessWorkerHost::new(
            model,
            settings.quota_check_interval,
            settings.user.language.clone(),
        ));
        let coordinator = StreamCoordinator::new(host, Arc::clone(&store), settings);
        let event_loop = coordinator.spawn_event_loop();
        Self {
            coordinator,
            store,
            event_loop,
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// What one request produced once the conversation went back to idle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    pub text: String,
    pub error: Option<GenerationErrorKind>,
    pub title: Option<String>,
    pub actions: Vec<String>,
}

/// Follow UI events for `key` until the current turn is over.
///
/// With `expect_meta` the turn only ends after title and suggestions
/// arrived, or when the description itself failed. `on_text` sees every
/// cumulative answer text, never the meta output.
pub async fn follow_turn(
    ui: &mut broadcast::Receiver<UiEvent>,
    key: ConversationKey,
    expect_meta: bool,
    mut on_text: impl FnMut(&str),
) -> Result<TurnOutcome> {
    let mut outcome = TurnOutcome::default();
    let mut meta_seen = false;
    loop {
        let event = match ui.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "terminal fell behind the UI bus");
                continue;
            }
            Err(RecvError::Closed) => bail!("UI bus closed"),
        };
        if event.key() != key {
            continue;
        }
        match event {
            UiEvent::StreamUpdate { is_meta: true, .. } => {}
            UiEvent::StreamUpdate { text, .. } => on_text(&text),
            UiEvent::StreamComplete { is_meta: true, .. } => {}
            UiEvent::StreamComplete { text, error, .. } => {
                if error.is_some() {
                    on_text(&text);
                    outcome.text = text;
                    outcome.error = error;
                    return Ok(outcome);
                }
                if outcome.text.is_empty() || !text.is_empty() {
                    on_text(&text);
                    outcome.text = text;
                }
                if !expect_meta || meta_seen {
                    return Ok(outcome);
                }
            }
            UiEvent::ConversationMeta { title, actions, .. } => {
                outcome.title = title;
                outcome.actions = actions;
                meta_seen = true;
            }
        }
    }
}
