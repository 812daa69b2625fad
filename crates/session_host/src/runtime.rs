//! Request loop of one worker instance.
//!
//! `createSession` and `sendPrompt` are acknowledged as soon as generation
//! is spawned; the answer follows as `streamUpdate` events and exactly one
//! `streamComplete`. Generations are owned by the instance and die with it.

use providers::LanguageModel;
use shared::error::{GenerationError, GenerationErrorKind};
use shared::ids::{ConversationKey, WorkerInstanceId};
use shared::messages::user_message;
use shared::protocol::{WorkerEvent, WorkerReply, WorkerRequest};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::session_store::SessionStore;

/// A request plus the slot for its direct reply
pub type Envelope = (WorkerRequest, oneshot::Sender<WorkerReply>);

pub struct WorkerRuntime {
    id: WorkerInstanceId,
    store: Arc<SessionStore>,
    events: broadcast::Sender<WorkerEvent>,
    default_language: String,
    generations: JoinSet<()>,
}

impl WorkerRuntime {
    pub fn new(
        id: WorkerInstanceId,
        model: Arc<dyn LanguageModel>,
        quota_check_interval: usize,
        default_language: impl Into<String>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            store: Arc::new(SessionStore::new(model, quota_check_interval)),
            events,
            default_language: default_language.into(),
            generations: JoinSet::new(),
        }
    }

    /// Serve requests until every sender is gone. In-flight generations
    /// are aborted when this returns.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Envelope>) {
        info!(worker = %self.id, "worker started");
        loop {
            tokio::select! {
                envelope = requests.recv() => {
                    let Some((request, reply_to)) = envelope else { break };
                    let reply = self.handle(request);
                    // The caller may have given up waiting
                    let _ = reply_to.send(reply);
                }
                Some(joined) = self.generations.join_next(), if !self.generations.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(worker = %self.id, "generation task panicked");
                        }
                    }
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    pub fn handle(&mut self, request: WorkerRequest) -> WorkerReply {
        debug!(worker = %self.id, action = request.action(), "request");
        match request {
            WorkerRequest::Ping => WorkerReply::ok(),
            WorkerRequest::CreateSession(req) => {
                let store = Arc::clone(&self.store);
                let events = self.events.clone();
                self.generations.spawn(async move {
                    let key = req.key;
                    let updates = events.clone();
                    let result = store
                        .create_session(&req, |text| publish_update(&updates, key, text))
                        .await;
                    finish(&events, key, &req.language, result);
                });
                WorkerReply::started()
            }
            WorkerRequest::SendPrompt(req) => {
                let store = Arc::clone(&self.store);
                let events = self.events.clone();
                let fallback_language = self.default_language.clone();
                self.generations.spawn(async move {
                    let key = req.key;
                    let language = store.language(key).await.unwrap_or(fallback_language);
                    let updates = events.clone();
                    let result = store
                        .continue_session(key, &req.turn, |text| publish_update(&updates, key, text))
                        .await;
                    finish(&events, key, &language, result);
                });
                WorkerReply::started()
            }
            WorkerRequest::DeleteSession { key } => {
                self.store.delete_session(key);
                WorkerReply::ok()
            }
        }
    }
}

fn publish_update(events: &broadcast::Sender<WorkerEvent>, key: ConversationKey, text: &str) {
    let _ = events.send(WorkerEvent::StreamUpdate {
        key,
        text: text.to_string(),
    });
}

/// Emit the terminal event. Errors are surfaced as a normal answer so the UI
/// has a single rendering path. A missing session only completes, since the
/// coordinator rebuilds it without showing anything.
fn finish(
    events: &broadcast::Sender<WorkerEvent>,
    key: ConversationKey,
    language: &str,
    result: Result<String, GenerationError>,
) {
    let event = match result {
        Ok(text) => WorkerEvent::StreamComplete {
            key,
            text,
            error: None,
        },
        Err(err) => {
            warn!(%key, "generation failed: {}", err);
            let text = user_message(&err, language);
            if err.partial().is_none() && err.kind() != GenerationErrorKind::SessionNotFound {
                publish_update(events, key, &text);
            }
            WorkerEvent::StreamComplete {
                key,
                text,
                error: Some(err.kind()),
            }
        }
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use providers::scripted::{Script, ScriptedModel};
    use shared::protocol::{CaptureKind, ConversationTurn, CreateSessionRequest, SendPromptRequest};

    fn runtime(model: &ScriptedModel) -> (WorkerRuntime, broadcast::Receiver<WorkerEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let rt = WorkerRuntime::new(WorkerInstanceId::new(1), Arc::new(model.clone()), 10, "en", tx);
        (rt, rx)
    }

    fn create(key: i64) -> WorkerRequest {
        WorkerRequest::CreateSession(CreateSessionRequest {
            key: ConversationKey::new(key),
            kind: CaptureKind::Image,
            initial_prompt: "Describe this image".into(),
            media: None,
            context: None,
            language: "en".into(),
            extra_turns: vec![],
        })
    }

    async fn until_complete(rx: &mut broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let done = event.is_complete();
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_ping_and_delete_are_plain_acks() {
        let model = ScriptedModel::new();
        let (mut rt, _rx) = runtime(&model);
        assert_eq!(rt.handle(WorkerRequest::Ping), WorkerReply::ok());
        assert_eq!(
            rt.handle(WorkerRequest::DeleteSession {
                key: ConversationKey::new(1)
            }),
            WorkerReply::ok()
        );
    }

    #[tokio::test]
    async fn test_create_acks_then_streams() {
        let model = ScriptedModel::new();
        model.push_script(Script::chunks(["A", "A cat"]));
        let (mut rt, mut rx) = runtime(&model);

        assert_eq!(rt.handle(create(5)), WorkerReply::started());
        let events = until_complete(&mut rx).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[1].text(), "A cat");
        assert_eq!(
            events[2],
            WorkerEvent::StreamComplete {
                key: ConversationKey::new(5),
                text: "A cat".into(),
                error: None
            }
        );
    }

    #[tokio::test]
    async fn test_prompt_without_session_only_completes() {
        let model = ScriptedModel::new();
        let (mut rt, mut rx) = runtime(&model);

        let reply = rt.handle(WorkerRequest::SendPrompt(SendPromptRequest {
            key: ConversationKey::new(2),
            turn: ConversationTurn::user("And the footer?"),
        }));
        assert!(reply.started);

        let events = until_complete(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            WorkerEvent::StreamComplete {
                error: Some(GenerationErrorKind::SessionNotFound),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_loop_replies_and_stops_with_senders() {
        let model = ScriptedModel::new();
        let (rt, _rx) = runtime(&model);
        let (tx, requests) = mpsc::channel(8);
        let task = tokio::spawn(rt.run(requests));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((WorkerRequest::Ping, reply_tx)).await.unwrap();
        assert!(reply_rx.await.unwrap().success);

        drop(tx);
        task.await.unwrap();
    }
}
