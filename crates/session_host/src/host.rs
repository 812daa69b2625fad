//! In-process worker host.
//!
//! Runs each worker instance as a tokio task behind a request channel, the
//! way a browser runs an offscreen document behind its message bus. At most
//! one instance exists at a time. Closing an instance aborts its task, which
//! drops every session and in-flight generation it owned.

use async_trait::async_trait;
use parking_lot::Mutex;
use providers::LanguageModel;
use shared::error::{HostError, TransportError};
use shared::host::WorkerHost;
use shared::ids::WorkerInstanceId;
use shared::protocol::{WorkerEvent, WorkerReply, WorkerRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::runtime::{Envelope, WorkerRuntime};

const REQUEST_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 1024;

struct Instance {
    id: WorkerInstanceId,
    requests: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

pub struct InProcessWorkerHost {
    model: Arc<dyn LanguageModel>,
    quota_check_interval: usize,
    default_language: String,
    events: broadcast::Sender<WorkerEvent>,
    current: Mutex<Option<Instance>>,
    next_id: AtomicU64,
}

impl InProcessWorkerHost {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        quota_check_interval: usize,
        default_language: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        Self {
            model,
            quota_check_interval,
            default_language: default_language.into(),
            events,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Envelope>> {
        self.current
            .lock()
            .as_ref()
            .filter(|instance| !instance.task.is_finished())
            .map(|instance| instance.requests.clone())
    }
}

#[async_trait]
impl WorkerHost for InProcessWorkerHost {
    async fn instances(&self) -> Vec<WorkerInstanceId> {
        self.current
            .lock()
            .as_ref()
            .filter(|instance| !instance.task.is_finished())
            .map(|instance| vec![instance.id])
            .unwrap_or_default()
    }

    async fn create_instance(&self) -> Result<WorkerInstanceId, HostError> {
        let mut current = self.current.lock();
        if let Some(instance) = current.as_ref() {
            if !instance.task.is_finished() {
                return Err(HostError(format!("{} is still running", instance.id)));
            }
        }

        let id = WorkerInstanceId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let runtime = WorkerRuntime::new(
            id,
            Arc::clone(&self.model),
            self.quota_check_interval,
            self.default_language.clone(),
            self.events.clone(),
        );
        let task = tokio::spawn(runtime.run(rx));
        *current = Some(Instance {
            id,
            requests: tx,
            task,
        });
        info!(worker = %id, "worker instance created");
        Ok(id)
    }

    async fn close_instance(&self) -> Result<(), HostError> {
        if let Some(instance) = self.current.lock().take() {
            instance.task.abort();
            info!(worker = %instance.id, "worker instance closed");
        }
        Ok(())
    }

    async fn dispatch(&self, request: WorkerRequest) -> Result<WorkerReply, TransportError> {
        let requests = self.sender().ok_or(TransportError::NoReceiver)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send((request, reply_tx))
            .await
            .map_err(|_| TransportError::NoReceiver)?;
        reply_rx.await.map_err(|_| TransportError::ChannelClosed)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

impl Drop for InProcessWorkerHost {
    fn drop(&mut self) {
        if let Some(instance) = self.current.get_mut().take() {
            instance.task.abort();
        }
    }
}
