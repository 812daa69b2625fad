//! Per-conversation streaming state machine.
//!
//! Phases per key:
//! `idle → streaming-initial → streaming-meta → idle` for a new analysis,
//! `idle → streaming-followup → idle` for a question.
//!
//! Worker events are classified by the key's phase and republished on the
//! UI bus. Phase and buffer maps live only in memory; after a restart an
//! update for an unknown key is treated as an initial generation.
//!
//! Worker sessions are lost whenever the worker is recreated. A prompt that
//! comes back with `SessionNotFound` is re-sent once as a `createSession`
//! replaying the stored record.

use parking_lot::Mutex;
use services::page_context::chunk_context;
use services::{ConversationRecord, ConversationStore};
use shared::error::GenerationErrorKind;
use shared::host::WorkerHost;
use shared::ids::ConversationKey;
use shared::messages::error_text;
use shared::page::PageSignals;
use shared::protocol::{
    CaptureKind, ConversationTurn, CreateSessionRequest, MediaPayload, SendPromptRequest,
    TurnRole, WorkerEvent, WorkerRequest,
};
use shared::settings::AppSettings;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::delivery::MessageDelivery;
use crate::error::{CoordinatorError, Result};
use crate::lifecycle::WorkerLifecycle;
use crate::meta::{parse_actions, parse_title, MAX_ACTIONS};
use crate::phase::{ConversationPhase, PhaseTable};
use crate::prompts::{initial_prompt, meta_prompt};
use crate::ui_bus::{UiBus, UiEvent};

/// A request to describe a screenshot or an image
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub key: ConversationKey,
    pub kind: CaptureKind,
    pub media: Option<MediaPayload>,
    /// Signals extracted from the page, packed into the context budget
    pub page: Option<PageSignals>,
}

/// What a surface needs to rebuild its view mid-stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub phase: ConversationPhase,
    pub text: String,
    pub record_id: Option<String>,
}

#[derive(Default)]
struct State {
    phases: PhaseTable,
    records: HashMap<ConversationKey, String>,
    /// Keys whose owner went away; their events are dropped
    closed: HashSet<ConversationKey>,
    /// Prompt turn in flight per key, kept until its stream completes
    pending: HashMap<ConversationKey, ConversationTurn>,
}

/// Work left after a worker event, done without holding the state lock
enum AfterEvent {
    Nothing,
    InitialDone(String),
    MetaDone(Option<String>),
    /// Assistant text to keep in the record
    Answered(String),
    /// The worker lost the session; rebuild it and re-ask the turn
    Rebuild(ConversationPhase, ConversationTurn),
}

struct Inner {
    delivery: MessageDelivery,
    store: Arc<dyn ConversationStore>,
    ui: UiBus,
    settings: AppSettings,
    state: Mutex<State>,
    record_writes: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct StreamCoordinator {
    inner: Arc<Inner>,
}

impl StreamCoordinator {
    pub fn new(
        host: Arc<dyn WorkerHost>,
        store: Arc<dyn ConversationStore>,
        settings: AppSettings,
    ) -> Self {
        let lifecycle = Arc::new(WorkerLifecycle::new(host, settings.timings.clone()));
        Self {
            inner: Arc::new(Inner {
                delivery: MessageDelivery::new(lifecycle),
                store,
                ui: UiBus::new(),
                settings,
                state: Mutex::new(State::default()),
                record_writes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn ui(&self) -> &UiBus {
        &self.inner.ui
    }

    pub fn lifecycle(&self) -> &Arc<WorkerLifecycle> {
        self.inner.delivery.lifecycle()
    }

    pub fn phase(&self, key: ConversationKey) -> Option<ConversationPhase> {
        self.inner.state.lock().phases.phase(key)
    }

    pub fn record_id(&self, key: ConversationKey) -> Option<String> {
        self.inner.state.lock().records.get(&key).cloned()
    }

    pub fn snapshot(&self, key: ConversationKey) -> Option<ConversationSnapshot> {
        let state = self.inner.state.lock();
        let phase = state.phases.phase(key)?;
        Some(ConversationSnapshot {
            phase,
            text: state.phases.buffer(key).unwrap_or_default().to_string(),
            record_id: state.records.get(&key).cloned(),
        })
    }

    /// Subscribe to worker events and process them on a background task.
    /// Call before issuing requests so no event is missed.
    pub fn spawn_event_loop(&self) -> JoinHandle<()> {
        let mut events = self.lifecycle().host().subscribe_events();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.handle_worker_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "coordinator fell behind worker events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("worker event stream closed");
        })
    }

    /// Describe a screenshot or image. Rejected while the key is streaming.
    pub async fn start_analysis(&self, request: AnalysisRequest) -> Result<()> {
        let key = request.key;
        self.begin(key, ConversationPhase::StreamingInitial)?;
        info!(%key, kind = ?request.kind, "starting analysis");

        let settings = &self.inner.settings;
        let context = request
            .page
            .as_ref()
            .map(|page| chunk_context(page, settings.context_budget_bytes))
            .filter(|c| !c.is_empty());
        let prompt = initial_prompt(request.kind, &settings.user, context.is_some());

        let mut record = ConversationRecord::new(key, request.kind, prompt.clone());
        record.url = request
            .page
            .as_ref()
            .map(|page| page.url.clone())
            .filter(|url| !url.is_empty());
        record.context = context.clone();
        if let Err(e) = self.inner.store.put(&record).await {
            self.inner.state.lock().phases.transition(key, ConversationPhase::Idle);
            return Err(CoordinatorError::Store(e));
        }
        self.inner.state.lock().records.insert(key, record.id.clone());

        let create = WorkerRequest::CreateSession(CreateSessionRequest {
            key,
            kind: request.kind,
            initial_prompt: prompt,
            media: request.media,
            context,
            language: settings.user.language.clone(),
            extra_turns: Vec::new(),
        });
        self.deliver(key, ConversationPhase::StreamingInitial, create)
            .await
    }

    /// Ask a follow-up question. Rejected while the key is streaming.
    pub async fn ask_followup(
        &self,
        key: ConversationKey,
        question: impl Into<String>,
        media: Option<MediaPayload>,
    ) -> Result<()> {
        let question = question.into();
        self.begin(key, ConversationPhase::StreamingFollowup)?;
        debug!(%key, "follow-up question");

        self.append_to_record(key, TurnRole::User, &question).await;

        let mut turn = ConversationTurn::user(question);
        if let Some(media) = media {
            turn = turn.with_media(media);
        }
        self.inner.state.lock().pending.insert(key, turn.clone());
        let send = WorkerRequest::SendPrompt(SendPromptRequest { key, turn });
        self.deliver(key, ConversationPhase::StreamingFollowup, send)
            .await
    }

    /// Continue a stored conversation under `key` by rebuilding its worker
    /// session and asking `question`.
    pub async fn resume_conversation(
        &self,
        key: ConversationKey,
        record_id: &str,
        question: impl Into<String>,
    ) -> Result<()> {
        let question = question.into();
        let record = self
            .inner
            .store
            .get(record_id)
            .await
            .map_err(CoordinatorError::Store)?
            .ok_or_else(|| CoordinatorError::RecordNotFound(record_id.to_string()))?;

        self.begin(key, ConversationPhase::StreamingFollowup)?;
        self.inner
            .state
            .lock()
            .records
            .insert(key, record.id.clone());
        info!(%key, record = %record.id, "resuming conversation");

        let mut extra_turns = record.replay_turns();
        extra_turns.push(ConversationTurn::user(question.clone()));

        let updated = self
            .update_record(&record.id, |r| {
                r.key = key;
                r.active = true;
                r.push_message(TurnRole::User, question);
            })
            .await;
        if let Err(e) = updated {
            warn!(%key, "could not update record: {}", e);
        }

        let create = WorkerRequest::CreateSession(CreateSessionRequest {
            key,
            kind: record.kind,
            initial_prompt: record.initial_prompt,
            media: None,
            context: record.context,
            language: self.inner.settings.user.language.clone(),
            extra_turns,
        });
        self.deliver(key, ConversationPhase::StreamingFollowup, create)
            .await
    }

    /// The owner of `key` went away: stop forwarding, drop the worker
    /// session and archive the record.
    pub async fn close_conversation(&self, key: ConversationKey) {
        let record_id = {
            let mut state = self.inner.state.lock();
            state.closed.insert(key);
            state.phases.remove(key);
            state.pending.remove(&key);
            state.records.remove(&key)
        };
        info!(%key, "conversation closed");

        // Don't bring a worker up just to delete nothing
        if !self.lifecycle().host().instances().await.is_empty() {
            if let Err(e) = self
                .inner
                .delivery
                .send(WorkerRequest::DeleteSession { key })
                .await
            {
                debug!(%key, "deleting worker session failed: {}", e);
            }
        }

        if let Some(id) = record_id {
            if let Err(e) = self.update_record(&id, |r| r.active = false).await {
                warn!(%key, "could not archive record: {}", e);
            }
        }
    }

    /// Classify one worker event by the key's phase and act on it
    pub async fn handle_worker_event(&self, event: WorkerEvent) {
        let key = event.key();
        let after = {
            let mut state = self.inner.state.lock();
            if state.closed.contains(&key) {
                debug!(%key, "dropping event for closed conversation");
                return;
            }

            let phase = match state.phases.phase(key) {
                Some(phase) => phase,
                None => {
                    info!(%key, "no phase recorded, treating as initial generation");
                    state.phases.transition(key, ConversationPhase::StreamingInitial);
                    ConversationPhase::StreamingInitial
                }
            };
            let is_meta = phase == ConversationPhase::StreamingMeta;

            match event {
                WorkerEvent::StreamUpdate { text, .. } => {
                    if phase.is_streaming() {
                        state.phases.set_buffer(key, &text);
                    }
                    self.inner.ui.publish(UiEvent::StreamUpdate {
                        key,
                        text,
                        is_followup: phase.is_followup(),
                        is_meta,
                    });
                    AfterEvent::Nothing
                }
                WorkerEvent::StreamComplete { text, error, .. } => {
                    let pending = state.pending.remove(&key);
                    let rebuild = match pending {
                        Some(turn)
                            if error == Some(GenerationErrorKind::SessionNotFound)
                                && state.records.contains_key(&key) =>
                        {
                            Some(turn)
                        }
                        _ => None,
                    };
                    match (phase, rebuild) {
                        (
                            ConversationPhase::StreamingMeta | ConversationPhase::StreamingFollowup,
                            Some(turn),
                        ) => {
                            info!(%key, ?phase, "worker lost the session, rebuilding from record");
                            AfterEvent::Rebuild(phase, turn)
                        }
                        (ConversationPhase::StreamingInitial, _) => {
                            self.inner.ui.publish(UiEvent::StreamComplete {
                                key,
                                text: text.clone(),
                                is_followup: false,
                                is_meta: false,
                                error,
                            });
                            match error {
                                None => {
                                    state.phases.transition(key, ConversationPhase::StreamingMeta);
                                    AfterEvent::InitialDone(text)
                                }
                                // No answer to title
                                Some(kind) => {
                                    state.phases.transition(key, ConversationPhase::Idle);
                                    kept_partial(kind, text)
                                }
                            }
                        }
                        // Stays in meta until the record is written
                        (ConversationPhase::StreamingMeta, _) => {
                            AfterEvent::MetaDone(error.is_none().then_some(text))
                        }
                        (ConversationPhase::StreamingFollowup, _) => {
                            self.inner.ui.publish(UiEvent::StreamComplete {
                                key,
                                text: text.clone(),
                                is_followup: true,
                                is_meta: false,
                                error,
                            });
                            state.phases.transition(key, ConversationPhase::Idle);
                            match error {
                                None => AfterEvent::Answered(text),
                                Some(kind) => kept_partial(kind, text),
                            }
                        }
                        (ConversationPhase::Idle, _) => {
                            debug!(%key, "completion while idle");
                            self.inner.ui.publish(UiEvent::StreamComplete {
                                key,
                                text,
                                is_followup: false,
                                is_meta: false,
                                error,
                            });
                            AfterEvent::Nothing
                        }
                    }
                }
            }
        };

        match after {
            AfterEvent::Nothing => {}
            AfterEvent::InitialDone(text) => {
                self.append_to_record(key, TurnRole::Assistant, &text).await;
                self.spawn_meta_request(key);
            }
            AfterEvent::MetaDone(output) => self.finish_meta(key, output.as_deref()).await,
            AfterEvent::Answered(text) => {
                self.append_to_record(key, TurnRole::Assistant, &text).await;
            }
            AfterEvent::Rebuild(phase, turn) => self.rebuild_session(key, phase, turn).await,
        }
    }

    fn begin(&self, key: ConversationKey, phase: ConversationPhase) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.phases.try_begin(key, phase).map_err(|current| {
            debug!(%key, ?current, "rejected, currently streaming");
            CoordinatorError::CurrentlyStreaming(key)
        })?;
        state.closed.remove(&key);
        state.pending.remove(&key);
        Ok(())
    }

    async fn deliver(
        &self,
        key: ConversationKey,
        phase: ConversationPhase,
        request: WorkerRequest,
    ) -> Result<()> {
        let action = request.action();
        match self.inner.delivery.send(request).await {
            Ok(reply) if reply.success => Ok(()),
            Ok(reply) => {
                let reason = reply.error.unwrap_or_else(|| "no reason given".to_string());
                warn!(%key, action, "worker rejected request: {}", reason);
                self.fail_generation(key, phase, GenerationErrorKind::Generic);
                Err(CoordinatorError::Rejected { action, reason })
            }
            Err(e) => {
                warn!(%key, action, "delivery failed: {}", e);
                self.fail_generation(key, phase, GenerationErrorKind::DeliveryFailed);
                Err(CoordinatorError::Delivery(e))
            }
        }
    }

    /// Report a generation that never started as a completed error stream,
    /// so surfaces have one rendering path, and free the key.
    fn fail_generation(
        &self,
        key: ConversationKey,
        phase: ConversationPhase,
        kind: GenerationErrorKind,
    ) {
        let mut state = self.inner.state.lock();
        if state.phases.phase(key) != Some(phase) {
            return;
        }
        state.phases.transition(key, ConversationPhase::Idle);
        let text = error_text(kind, &self.inner.settings.user.language).to_string();
        self.inner.ui.publish(UiEvent::StreamComplete {
            key,
            text,
            is_followup: phase.is_followup(),
            is_meta: false,
            error: Some(kind),
        });
    }

    fn spawn_meta_request(&self, key: ConversationKey) {
        let this = self.clone();
        tokio::spawn(async move {
            let prompt = meta_prompt(&this.inner.settings.user.language, MAX_ACTIONS);
            let turn = ConversationTurn::user(prompt);
            this.inner.state.lock().pending.insert(key, turn.clone());
            let request = WorkerRequest::SendPrompt(SendPromptRequest { key, turn });
            match this.inner.delivery.send(request).await {
                Ok(reply) if reply.success => {}
                Ok(reply) => {
                    warn!(%key, "meta request rejected: {:?}", reply.error);
                    this.finish_meta(key, None).await;
                }
                Err(e) => {
                    warn!(%key, "meta request failed: {}", e);
                    this.finish_meta(key, None).await;
                }
            }
        });
    }

    /// Re-create the worker session for `key` from its record and ask
    /// `turn` again. Only one attempt: `createSession` never reports a
    /// missing session.
    async fn rebuild_session(
        &self,
        key: ConversationKey,
        phase: ConversationPhase,
        turn: ConversationTurn,
    ) {
        let record = match self.record_id(key) {
            Some(id) => self.inner.store.get(&id).await,
            None => Ok(None),
        };
        let record = match record {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(%key, "no record to rebuild the session from");
                self.abandon_turn(key, phase).await;
                return;
            }
            Err(e) => {
                warn!(%key, "could not load record for rebuild: {}", e);
                self.abandon_turn(key, phase).await;
                return;
            }
        };

        let mut extra_turns = record.replay_turns();
        // A question is stored before it is sent
        if extra_turns
            .last()
            .is_some_and(|last| last.role == TurnRole::User && last.text == turn.text)
        {
            extra_turns.pop();
        }
        extra_turns.push(turn);

        let create = WorkerRequest::CreateSession(CreateSessionRequest {
            key,
            kind: record.kind,
            initial_prompt: record.initial_prompt,
            media: None,
            context: record.context,
            language: self.inner.settings.user.language.clone(),
            extra_turns,
        });
        if phase == ConversationPhase::StreamingMeta {
            match self.inner.delivery.send(create).await {
                Ok(reply) if reply.success => {}
                Ok(reply) => {
                    warn!(%key, "meta rebuild rejected: {:?}", reply.error);
                    self.finish_meta(key, None).await;
                }
                Err(e) => {
                    warn!(%key, "meta rebuild failed: {}", e);
                    self.finish_meta(key, None).await;
                }
            }
        } else if let Err(e) = self.deliver(key, phase, create).await {
            debug!(%key, "rebuild not delivered: {}", e);
        }
    }

    async fn abandon_turn(&self, key: ConversationKey, phase: ConversationPhase) {
        if phase == ConversationPhase::StreamingMeta {
            self.finish_meta(key, None).await;
        } else {
            self.fail_generation(key, phase, GenerationErrorKind::SessionNotFound);
        }
    }

    /// Persist title and actions, mark the conversation active and return
    /// the key to idle. Missing title or actions never block this.
    async fn finish_meta(&self, key: ConversationKey, output: Option<&str>) {
        let record_id = {
            let state = self.inner.state.lock();
            if state.phases.phase(key) != Some(ConversationPhase::StreamingMeta) {
                return;
            }
            state.records.get(&key).cloned()
        };

        let title = output.and_then(parse_title);
        let actions = output.map(parse_actions).unwrap_or_default();
        debug!(%key, ?title, actions = actions.len(), "meta parsed");

        let mut answer = String::new();
        if let Some(id) = record_id {
            let updated = self
                .update_record(&id, |r| {
                    if title.is_some() {
                        r.title = title.clone();
                    }
                    r.actions = actions.clone();
                    r.active = true;
                })
                .await;
            match updated {
                Ok(Some(record)) => {
                    if let Some(last) = record
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == TurnRole::Assistant)
                    {
                        answer = last.text.clone();
                    }
                }
                Ok(None) => debug!(%key, "record vanished before meta"),
                Err(e) => warn!(%key, "could not store title and actions: {}", e),
            }
        }

        let mut state = self.inner.state.lock();
        if state.phases.phase(key) != Some(ConversationPhase::StreamingMeta) {
            return;
        }
        state.phases.transition(key, ConversationPhase::Idle);
        self.inner.ui.publish(UiEvent::ConversationMeta {
            key,
            title,
            actions,
        });
        // Tagged as a follow-up so surfaces don't show a second thinking state
        self.inner.ui.publish(UiEvent::StreamComplete {
            key,
            text: answer,
            is_followup: true,
            is_meta: false,
            error: None,
        });
        info!(%key, "conversation ready");
    }

    async fn append_to_record(&self, key: ConversationKey, role: TurnRole, text: &str) {
        let Some(id) = self.record_id(key) else {
            return;
        };
        if let Err(e) = self.update_record(&id, |r| r.push_message(role, text)).await {
            warn!(%key, "could not update record: {}", e);
        }
    }

    async fn update_record<F>(&self, id: &str, f: F) -> anyhow::Result<Option<ConversationRecord>>
    where
        F: FnOnce(&mut ConversationRecord) + Send,
    {
        let _guard = self.inner.record_writes.lock().await;
        let Some(mut record) = self.inner.store.get(id).await? else {
            return Ok(None);
        };
        f(&mut record);
        record.touch();
        self.inner.store.put(&record).await?;
        Ok(Some(record))
    }
}

/// Text cut short by the quota still belongs to the conversation
fn kept_partial(kind: GenerationErrorKind, text: String) -> AfterEvent {
    if kind == GenerationErrorKind::QuotaExceeded && !text.is_empty() {
        AfterEvent::Answered(text)
    } else {
        AfterEvent::Nothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use services::InMemoryConversationStore;
    use shared::page::MetaTag;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        host: Arc<FakeHost>,
        store: Arc<InMemoryConversationStore>,
        coordinator: StreamCoordinator,
        ui: broadcast::Receiver<UiEvent>,
        _events: JoinHandle<()>,
    }

    fn harness() -> Harness {
        let host = Arc::new(FakeHost::new());
        let store = Arc::new(InMemoryConversationStore::new());
        let coordinator = StreamCoordinator::new(host.clone(), store.clone(), AppSettings::default());
        let ui = coordinator.ui().subscribe();
        let events = coordinator.spawn_event_loop();
        Harness {
            host,
            store,
            coordinator,
            ui,
            _events: events,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn drain(ui: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = ui.try_recv() {
            events.push(event);
        }
        events
    }

    fn screenshot(key: i64) -> AnalysisRequest {
        AnalysisRequest {
            key: ConversationKey::new(key),
            kind: CaptureKind::Screenshot,
            media: None,
            page: Some(PageSignals {
                title: "Tide pools".into(),
                meta: vec![MetaTag {
                    name: "description".into(),
                    content: "Life between the tides".into(),
                }],
                url: "https://example.com/tide-pools".into(),
                ..PageSignals::default()
            }),
        }
    }

    fn update(key: i64, text: &str) -> WorkerEvent {
        WorkerEvent::StreamUpdate {
            key: ConversationKey::new(key),
            text: text.into(),
        }
    }

    fn complete(key: i64, text: &str) -> WorkerEvent {
        WorkerEvent::StreamComplete {
            key: ConversationKey::new(key),
            text: text.into(),
            error: None,
        }
    }

    /// Run key 7 through the initial analysis until idle
    async fn analyse(h: &Harness) {
        let key = ConversationKey::new(7);
        h.coordinator.start_analysis(screenshot(7)).await.unwrap();
        h.host.emit(update(7, "Desc"));
        h.host.emit(update(7, "Description"));
        h.host.emit(complete(7, "Description."));
        wait_until(|| h.host.requests().len() == 2).await;
        h.host.emit(complete(
            7,
            "perceptaTitle: \"A Title\"\nperceptaActions: [\"Q1\",\"Q2\"]",
        ));
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_analysis_scenario() {
        let mut h = harness();
        let key = ConversationKey::new(7);

        h.coordinator.start_analysis(screenshot(7)).await.unwrap();
        let requests = h.host.requests();
        let WorkerRequest::CreateSession(create) = &requests[0] else {
            panic!("expected createSession");
        };
        assert_eq!(create.key, key);
        assert_eq!(create.kind, CaptureKind::Screenshot);
        assert!(create.context.as_deref().unwrap().contains("Title: Tide pools"));

        h.host.emit(update(7, "Desc"));
        h.host.emit(update(7, "Description"));
        wait_until(|| h.coordinator.snapshot(key).map(|s| s.text) == Some("Description".into())).await;

        h.host.emit(complete(7, "Description."));
        wait_until(|| h.host.requests().len() == 2).await;
        assert_eq!(h.coordinator.phase(key), Some(ConversationPhase::StreamingMeta));
        let requests = h.host.requests();
        let WorkerRequest::SendPrompt(meta) = &requests[1] else {
            panic!("expected the combined title/actions turn");
        };
        assert!(meta.turn.text.contains("perceptaTitle"));
        assert!(meta.turn.text.contains("perceptaActions"));

        h.host.emit(complete(
            7,
            "perceptaTitle: \"A Title\"\nperceptaActions: [\"Q1\",\"Q2\"]",
        ));
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;

        let id = h.coordinator.record_id(key).unwrap();
        let record = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("A Title"));
        assert_eq!(record.actions, vec!["Q1", "Q2"]);
        assert!(record.active);
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].text, "Description.");
        assert_eq!(record.url.as_deref(), Some("https://example.com/tide-pools"));

        let events = drain(&mut h.ui);
        assert!(events.contains(&UiEvent::ConversationMeta {
            key,
            title: Some("A Title".into()),
            actions: vec!["Q1".into(), "Q2".into()],
        }));
        assert_eq!(
            events.last(),
            Some(&UiEvent::StreamComplete {
                key,
                text: "Description.".into(),
                is_followup: true,
                is_meta: false,
                error: None,
            })
        );
        assert_eq!(h.coordinator.snapshot(key).unwrap().text, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_rejected_while_streaming() {
        let h = harness();
        let key = ConversationKey::new(7);
        h.coordinator.start_analysis(screenshot(7)).await.unwrap();
        let pings = h.host.pings();

        let err = h.coordinator.ask_followup(key, "And the footer?", None).await;
        assert!(matches!(err, Err(CoordinatorError::CurrentlyStreaming(k)) if k == key));
        let err = h.coordinator.start_analysis(screenshot(7)).await;
        assert!(matches!(err, Err(CoordinatorError::CurrentlyStreaming(_))));

        // Nothing reached the worker
        assert_eq!(h.host.requests().len(), 1);
        assert_eq!(h.host.pings(), pings);

        // Another key is independent
        h.coordinator.start_analysis(screenshot(8)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_phase_also_rejects_questions() {
        let h = harness();
        let key = ConversationKey::new(7);
        h.coordinator.start_analysis(screenshot(7)).await.unwrap();
        h.host.emit(complete(7, "Description."));
        wait_until(|| h.host.requests().len() == 2).await;

        let err = h.coordinator.ask_followup(key, "Too early", None).await;
        assert!(matches!(err, Err(CoordinatorError::CurrentlyStreaming(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_followup_round_trip() {
        let mut h = harness();
        let key = ConversationKey::new(7);
        analyse(&h).await;
        drain(&mut h.ui);

        h.coordinator
            .ask_followup(key, "And the footer?", None)
            .await
            .unwrap();
        assert_eq!(h.coordinator.phase(key), Some(ConversationPhase::StreamingFollowup));
        assert!(matches!(
            &h.host.requests()[2],
            WorkerRequest::SendPrompt(req) if req.turn.text == "And the footer?"
        ));

        h.host.emit(update(7, "The footer"));
        h.host.emit(complete(7, "The footer has links."));
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;

        let events = drain(&mut h.ui);
        assert_eq!(
            events,
            vec![
                UiEvent::StreamUpdate {
                    key,
                    text: "The footer".into(),
                    is_followup: true,
                    is_meta: false,
                },
                UiEvent::StreamComplete {
                    key,
                    text: "The footer has links.".into(),
                    is_followup: true,
                    is_meta: false,
                    error: None,
                },
            ]
        );

        let id = h.coordinator.record_id(key).unwrap();
        for _ in 0..100 {
            if h.store.get(&id).await.unwrap().unwrap().messages.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.messages.len(), 3);
        assert_eq!(record.messages[1].text, "And the footer?");
        assert_eq!(record.messages[2].text, "The footer has links.");
    }

    fn session_lost(key: i64) -> WorkerEvent {
        WorkerEvent::StreamComplete {
            key: ConversationKey::new(key),
            text: "This conversation has expired.".into(),
            error: Some(GenerationErrorKind::SessionNotFound),
        }
    }

    async fn stored_messages(h: &Harness, id: &str, len: usize) -> Vec<String> {
        for _ in 0..100 {
            let record = h.store.get(id).await.unwrap().unwrap();
            if record.messages.len() == len {
                return record.messages.into_iter().map(|m| m.text).collect();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record never reached {} messages", len);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_is_rebuilt_for_followup() {
        let mut h = harness();
        let key = ConversationKey::new(7);
        analyse(&h).await;
        drain(&mut h.ui);

        h.coordinator
            .ask_followup(key, "And the footer?", None)
            .await
            .unwrap();
        h.host.emit(session_lost(7));
        wait_until(|| h.host.requests().len() == 4).await;

        let requests = h.host.requests();
        let WorkerRequest::CreateSession(create) = &requests[3] else {
            panic!("expected the session to be recreated");
        };
        assert_eq!(create.key, key);
        assert!(create.context.as_deref().unwrap().contains("Title: Tide pools"));
        assert_eq!(
            create.extra_turns,
            vec![
                ConversationTurn::assistant("Description."),
                ConversationTurn::user("And the footer?"),
            ]
        );
        // Nothing about the lost session reached the surface
        assert_eq!(h.coordinator.phase(key), Some(ConversationPhase::StreamingFollowup));
        assert!(drain(&mut h.ui).is_empty());

        h.host.emit(complete(7, "The footer has links."));
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;
        assert!(matches!(
            drain(&mut h.ui).as_slice(),
            [UiEvent::StreamComplete { error: None, is_followup: true, .. }]
        ));

        let id = h.coordinator.record_id(key).unwrap();
        let texts = stored_messages(&h, &id, 3).await;
        assert_eq!(texts, vec!["Description.", "And the footer?", "The footer has links."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_is_rebuilt_for_meta() {
        let h = harness();
        let key = ConversationKey::new(7);
        h.coordinator.start_analysis(screenshot(7)).await.unwrap();
        h.host.emit(complete(7, "Description."));
        wait_until(|| h.host.requests().len() == 2).await;

        h.host.emit(session_lost(7));
        wait_until(|| h.host.requests().len() == 3).await;
        let requests = h.host.requests();
        let WorkerRequest::CreateSession(create) = &requests[2] else {
            panic!("expected the session to be recreated");
        };
        assert_eq!(create.extra_turns.len(), 2);
        assert_eq!(create.extra_turns[0], ConversationTurn::assistant("Description."));
        assert!(create.extra_turns[1].text.contains("perceptaTitle"));
        assert_eq!(h.coordinator.phase(key), Some(ConversationPhase::StreamingMeta));

        h.host.emit(complete(7, "perceptaTitle: \"Rebuilt\"\nperceptaActions: []"));
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;
        let id = h.coordinator.record_id(key).unwrap();
        let record = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("Rebuilt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_lost_session_is_reported() {
        let mut h = harness();
        let key = ConversationKey::new(7);
        analyse(&h).await;
        h.coordinator.ask_followup(key, "Again?", None).await.unwrap();
        h.host.emit(session_lost(7));
        wait_until(|| h.host.requests().len() == 4).await;
        drain(&mut h.ui);

        h.host.emit(session_lost(7));
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;
        assert!(matches!(
            drain(&mut h.ui).as_slice(),
            [UiEvent::StreamComplete {
                error: Some(GenerationErrorKind::SessionNotFound),
                ..
            }]
        ));
        assert_eq!(h.host.requests().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_partial_is_kept_in_record() {
        let h = harness();
        let key = ConversationKey::new(7);
        analyse(&h).await;

        h.coordinator.ask_followup(key, "Tell me more", None).await.unwrap();
        h.host.emit(WorkerEvent::StreamComplete {
            key,
            text: "The reef is".into(),
            error: Some(GenerationErrorKind::QuotaExceeded),
        });
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;

        let id = h.coordinator.record_id(key).unwrap();
        let texts = stored_messages(&h, &id, 3).await;
        assert_eq!(texts[2], "The reef is");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_error_skips_meta() {
        let h = harness();
        let key = ConversationKey::new(7);
        h.coordinator.start_analysis(screenshot(7)).await.unwrap();

        h.host.emit(WorkerEvent::StreamComplete {
            key,
            text: "The model isn't available.".into(),
            error: Some(GenerationErrorKind::LanguageModelUnavailable),
        });
        wait_until(|| h.coordinator.phase(key) == Some(ConversationPhase::Idle)).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.host.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_key_is_treated_as_initial() {
        let mut h = harness();
        let key = ConversationKey::new(42);

        h.host.emit(update(42, "Half a description"));
        wait_until(|| h.coordinator.phase(key).is_some()).await;

        assert_eq!(
            h.coordinator.snapshot(key),
            Some(ConversationSnapshot {
                phase: ConversationPhase::StreamingInitial,
                text: "Half a description".into(),
                record_id: None,
            })
        );
        assert!(matches!(
            drain(&mut h.ui).as_slice(),
            [UiEvent::StreamUpdate { is_followup: false, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_is_reported_as_stream() {
        let mut h = harness();
        let key = ConversationKey::new(7);
        h.host.set_ping_hangs(true);

        let err = h.coordinator.start_analysis(screenshot(7)).await;
        assert!(matches!(err, Err(CoordinatorError::Delivery(_))));
        assert_eq!(h.coordinator.phase(key), Some(ConversationPhase::Idle));

        let events = drain(&mut h.ui);
        assert!(matches!(
            events.as_slice(),
            [UiEvent::StreamComplete {
                error: Some(GenerationErrorKind::DeliveryFailed),
                is_followup: false,
                ..
            }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_forwarding_and_archives() {
        let mut h = harness();
        let key = ConversationKey::new(7);
        analyse(&h).await;
        let id = h.coordinator.record_id(key).unwrap();
        drain(&mut h.ui);

        h.coordinator.close_conversation(key).await;
        assert!(h
            .host
            .requests()
            .contains(&WorkerRequest::DeleteSession { key }));

        h.host.emit(update(7, "late chunk"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut h.ui).is_empty());
        assert_eq!(h.coordinator.phase(key), None);

        let record = h.store.get(&id).await.unwrap().unwrap();
        assert!(!record.active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_replays_record() {
        let h = harness();
        let mut record = ConversationRecord::new(
            ConversationKey::new(3),
            CaptureKind::Image,
            "Describe this image",
        );
        record.push_message(TurnRole::Assistant, "A harbor seal on a rock.");
        h.store.put(&record).await.unwrap();

        let key = ConversationKey::new(9);
        h.coordinator
            .resume_conversation(key, &record.id, "Is it a pup?")
            .await
            .unwrap();
        assert_eq!(h.coordinator.phase(key), Some(ConversationPhase::StreamingFollowup));

        let requests = h.host.requests();
        let WorkerRequest::CreateSession(create) = &requests[0] else {
            panic!("expected createSession");
        };
        assert_eq!(create.key, key);
        assert_eq!(create.initial_prompt, "Describe this image");
        assert_eq!(
            create.extra_turns,
            vec![
                ConversationTurn::assistant("A harbor seal on a rock."),
                ConversationTurn::user("Is it a pup?"),
            ]
        );

        let stored = h.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.key, key);
        assert_eq!(stored.messages.len(), 2);

        assert!(matches!(
            h.coordinator.resume_conversation(key, "missing", "?").await,
            Err(CoordinatorError::RecordNotFound(_))
        ));
    }
}
