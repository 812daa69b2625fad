//! Worker lifecycle management.
//!
//! Makes sure exactly one live worker instance answers requests. The host
//! may reclaim the worker whenever it likes, so readiness is re-established
//! on demand rather than tracked.
//!
//! Features:
//! - Health probe (`ping`) under a short deadline
//! - Close-and-recreate when the probe fails or no instance exists
//! - Settle delay plus bounded re-probing after creation
//! - Concurrent callers share one bring-up

use shared::error::DeliveryError;
use shared::host::WorkerHost;
use shared::protocol::WorkerRequest;
use shared::settings::DeliveryTimings;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    pub instances_created: u64,
    pub probes_sent: u64,
    pub probes_failed: u64,
}

pub struct WorkerLifecycle {
    host: Arc<dyn WorkerHost>,
    timings: DeliveryTimings,
    bring_up: tokio::sync::Mutex<()>,
    stats: parking_lot::Mutex<LifecycleStats>,
}

impl WorkerLifecycle {
    pub fn new(host: Arc<dyn WorkerHost>, timings: DeliveryTimings) -> Self {
        Self {
            host,
            timings,
            bring_up: tokio::sync::Mutex::new(()),
            stats: parking_lot::Mutex::new(LifecycleStats::default()),
        }
    }

    pub fn host(&self) -> &Arc<dyn WorkerHost> {
        &self.host
    }

    pub fn timings(&self) -> &DeliveryTimings {
        &self.timings
    }

    pub fn stats(&self) -> LifecycleStats {
        *self.stats.lock()
    }

    /// One `ping` under the probe deadline
    pub async fn probe(&self) -> bool {
        self.stats.lock().probes_sent += 1;
        let ok = matches!(
            timeout(self.timings.probe_timeout(), self.host.dispatch(WorkerRequest::Ping)).await,
            Ok(Ok(reply)) if reply.success
        );
        if !ok {
            self.stats.lock().probes_failed += 1;
        }
        ok
    }

    /// Guarantee a live worker. Cheap when one is already answering, so it
    /// is called before every request.
    pub async fn ensure_worker_ready(&self) -> Result<(), DeliveryError> {
        let _guard = self.bring_up.lock().await;
        if !self.host.instances().await.is_empty() {
            if self.probe().await {
                return Ok(());
            }
            warn!("worker did not answer probe, recreating");
        }
        self.bring_up_worker().await
    }

    /// Tear down whatever is there and start over
    pub async fn recreate(&self) -> Result<(), DeliveryError> {
        let _guard = self.bring_up.lock().await;
        self.bring_up_worker().await
    }

    /// Ask the host to close the current instance; failures are ignored
    pub async fn close_worker(&self) {
        if let Err(e) = self.host.close_instance().await {
            debug!("closing worker failed: {}", e);
        }
    }

    async fn bring_up_worker(&self) -> Result<(), DeliveryError> {
        self.close_worker().await;
        match self.host.create_instance().await {
            Ok(id) => {
                self.stats.lock().instances_created += 1;
                info!(worker = %id, "worker instance requested");
            }
            // An instance that survived the close may still answer below
            Err(e) => warn!("worker creation failed: {}", e),
        }

        sleep(self.timings.settle_delay()).await;

        let attempts = self.timings.probe_attempts.max(1);
        for attempt in 1..=attempts {
            if self.probe().await {
                debug!(attempt, "worker ready");
                return Ok(());
            }
            if attempt < attempts {
                sleep(self.timings.probe_retry_delay()).await;
            }
        }

        warn!(attempts, "worker never became ready");
        Err(DeliveryError::WorkerUnavailable { attempts })
    }
}
