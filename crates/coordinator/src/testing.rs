//! Scriptable `WorkerHost` for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared::error::{HostError, TransportError};
use shared::host::WorkerHost;
use shared::ids::WorkerInstanceId;
use shared::protocol::{WorkerEvent, WorkerReply, WorkerRequest};
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// How the next non-ping request misbehaves
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// The reply never arrives
    Hang,
    /// Nobody is listening
    NoReceiver,
    /// The worker answers `success: false`
    Refuse,
}

#[derive(Default)]
struct FakeState {
    instances: Vec<WorkerInstanceId>,
    next_id: u64,
    created: usize,
    closed: usize,
    pings: usize,
    requests: Vec<WorkerRequest>,
    faults: VecDeque<Fault>,
    ping_hangs: bool,
    refuse_create: bool,
}

pub struct FakeHost {
    state: Mutex<FakeState>,
    events: broadcast::Sender<WorkerEvent>,
}

impl FakeHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(FakeState::default()),
            events,
        }
    }

    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    pub fn set_ping_hangs(&self, hangs: bool) {
        self.state.lock().ping_hangs = hangs;
    }

    pub fn set_refuse_create(&self, refuse: bool) {
        self.state.lock().refuse_create = refuse;
    }

    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn pings(&self) -> usize {
        self.state.lock().pings
    }

    /// Non-ping requests in arrival order
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.state.lock().requests.clone()
    }

    pub fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl WorkerHost for FakeHost {
    async fn instances(&self) -> Vec<WorkerInstanceId> {
        self.state.lock().instances.clone()
    }

    async fn create_instance(&self) -> Result<WorkerInstanceId, HostError> {
        let mut state = self.state.lock();
        if state.refuse_create {
            return Err(HostError("creation refused".into()));
        }
        state.next_id += 1;
        state.created += 1;
        let id = WorkerInstanceId::new(state.next_id);
        state.instances = vec![id];
        Ok(id)
    }

    async fn close_instance(&self) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if !state.instances.is_empty() {
            state.closed += 1;
        }
        state.instances.clear();
        Ok(())
    }

    async fn dispatch(&self, request: WorkerRequest) -> Result<WorkerReply, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            if state.instances.is_empty() {
                return Err(TransportError::NoReceiver);
            }
            if request == WorkerRequest::Ping {
                state.pings += 1;
                if state.ping_hangs {
                    None
                } else {
                    Some(Ok(WorkerReply::ok()))
                }
            } else {
                state.requests.push(request.clone());
                match state.faults.pop_front() {
                    Some(Fault::Hang) => None,
                    Some(Fault::NoReceiver) => Some(Err(TransportError::NoReceiver)),
                    Some(Fault::Refuse) => Some(Ok(WorkerReply::failed("refused"))),
                    None if request.delivery_mode() == shared::protocol::DeliveryMode::Stream => {
                        Some(Ok(WorkerReply::started()))
                    }
                    None => Some(Ok(WorkerReply::ok())),
                }
            }
        };
        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}
