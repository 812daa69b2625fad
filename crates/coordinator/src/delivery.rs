//! Message delivery to the worker context.
//!
//! Two shapes of request:
//! - await-ack (`ping`, `deleteSession`): one round trip under the RPC deadline
//! - stream (`createSession`, `sendPrompt`): the reply only acknowledges that
//!   generation started. The call succeeds on whichever comes first, the
//!   acknowledgement or a stream event for the same key.
//!
//! A transport failure recreates the worker and retries once. There is no
//! third attempt.

use shared::error::{DeliveryError, TransportError};
use shared::protocol::{DeliveryMode, WorkerReply, WorkerRequest};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::lifecycle::WorkerLifecycle;

pub struct MessageDelivery {
    lifecycle: Arc<WorkerLifecycle>,
}

impl MessageDelivery {
    pub fn new(lifecycle: Arc<WorkerLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub fn lifecycle(&self) -> &Arc<WorkerLifecycle> {
        &self.lifecycle
    }

    /// Deliver `request`, retrying once on transport failure.
    ///
    /// A reply with `success: false` is returned as-is; only transport
    /// failures are retried.
    pub async fn send(&self, request: WorkerRequest) -> Result<WorkerReply, DeliveryError> {
        self.lifecycle.ensure_worker_ready().await?;

        let cause = match self.attempt(&request).await {
            Ok(reply) => return Ok(reply),
            Err(cause) => cause,
        };
        warn!(action = request.action(), "delivery failed ({}), recreating worker", cause);

        self.lifecycle.close_worker().await;
        self.lifecycle.ensure_worker_ready().await?;
        sleep(self.lifecycle.timings().settle_delay()).await;

        self.attempt(&request).await.map_err(|cause| {
            warn!(action = request.action(), "retry failed: {}", cause);
            DeliveryError::DeliveryFailed { cause }
        })
    }

    async fn attempt(&self, request: &WorkerRequest) -> Result<WorkerReply, TransportError> {
        match request.delivery_mode() {
            DeliveryMode::AwaitAck => self.round_trip(request).await,
            DeliveryMode::Stream => self.start_stream(request).await,
        }
    }

    async fn round_trip(&self, request: &WorkerRequest) -> Result<WorkerReply, TransportError> {
        let deadline = self.lifecycle.timings().rpc_timeout();
        timeout(deadline, self.lifecycle.host().dispatch(request.clone()))
            .await
            .map_err(|_| TransportError::Timeout {
                what: "reply",
                after: deadline,
            })?
    }

    async fn start_stream(&self, request: &WorkerRequest) -> Result<WorkerReply, TransportError> {
        let timings = self.lifecycle.timings();
        let key = request.key();
        let host = self.lifecycle.host();

        // Subscribe before dispatching so an early event is not missed
        let mut events = host.subscribe_events();
        let ack = timeout(timings.ack_timeout(), host.dispatch(request.clone()));
        let grace = sleep(timings.stream_grace());
        tokio::pin!(ack, grace);
        let mut ack_timed_out = false;

        loop {
            tokio::select! {
                result = &mut ack, if !ack_timed_out => match result {
                    Ok(Ok(reply)) => return Ok(reply),
                    // The request never reached a worker, so no event will follow
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        debug!(action = request.action(), "no acknowledgement, waiting for stream");
                        ack_timed_out = true;
                    }
                },
                event = events.recv() => match event {
                    Ok(event) if Some(event.key()) == key => {
                        debug!(action = request.action(), "stream observed before acknowledgement");
                        return Ok(WorkerReply::started());
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(TransportError::ChannelClosed),
                },
                _ = &mut grace => {
                    return Err(TransportError::Timeout {
                        what: "stream start",
                        after: timings.stream_grace(),
                    });
                }
            }
        }
    }
}
