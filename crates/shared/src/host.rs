//! The seam between the coordinator and whatever hosts the worker context.
//!
//! The host may reclaim a worker at any time, so callers never assume an
//! instance persists between calls.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{HostError, TransportError};
use crate::ids::WorkerInstanceId;
use crate::protocol::{WorkerEvent, WorkerReply, WorkerRequest};

#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Worker instances the host currently knows about
    async fn instances(&self) -> Vec<WorkerInstanceId>;

    /// Ask the host to bring up a fresh worker instance
    async fn create_instance(&self) -> Result<WorkerInstanceId, HostError>;

    /// Tear down the current worker instance, if any
    async fn close_instance(&self) -> Result<(), HostError>;

    /// Deliver one request and wait for its direct reply. No deadline is
    /// applied here; the delivery layer races this against its own timers.
    async fn dispatch(&self, request: WorkerRequest) -> Result<WorkerReply, TransportError>;

    /// Stream events emitted by any worker instance
    fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent>;
}
