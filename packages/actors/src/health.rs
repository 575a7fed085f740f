//! Periodic liveness probing of the worker pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dispatch_core::WorkerId;
use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::registry::WorkerRegistry;

/// Future type for async probes.
pub type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Checks a worker's liveness endpoint. `true` means healthy.
pub trait HealthProbe: Send + Sync + 'static {
    fn probe(&self, worker_id: &WorkerId) -> ProbeFuture;
}

/// A closure-based probe.
pub struct FnProbe<F>
where
    F: Fn(&WorkerId) -> ProbeFuture + Send + Sync + 'static,
{
    probe: F,
}

impl<F> FnProbe<F>
where
    F: Fn(&WorkerId) -> ProbeFuture + Send + Sync + 'static,
{
    pub fn new(probe: F) -> Self {
        Self { probe }
    }
}

impl<F> HealthProbe for FnProbe<F>
where
    F: Fn(&WorkerId) -> ProbeFuture + Send + Sync + 'static,
{
    fn probe(&self, worker_id: &WorkerId) -> ProbeFuture {
        (self.probe)(worker_id)
    }
}

/// Feeds probe results into the registry.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<WorkerRegistry>, probe: Arc<dyn HealthProbe>, interval: Duration) -> Self {
        Self {
            registry,
            probe,
            interval,
        }
    }

    /// Probe every registered worker once. Returns how many passed.
    pub async fn check_once(&self) -> usize {
        let ids = self.registry.ids();
        let results = join_all(ids.iter().map(|id| self.probe.probe(id))).await;

        let mut healthy = 0;
        for (id, ok) in ids.iter().zip(results) {
            let marked = if ok {
                healthy += 1;
                self.registry.mark_healthy(id)
            } else {
                self.registry.mark_unhealthy(id)
            };
            // Deregistered while the probe was in flight.
            if let Err(e) = marked {
                tracing::debug!(worker_id = %id, error = %e, "Skipping probe result");
            }
        }
        healthy
    }

    /// Probe on every tick until the task is aborted. The first tick is immediate.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let healthy = self.check_once().await;
                tracing::debug!(healthy, total = self.registry.len(), "Health check complete");
            }
        })
    }
}
