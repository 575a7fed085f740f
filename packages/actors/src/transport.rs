//! Outbound delivery of job envelopes to worker processes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use dispatch_core::{JobEnvelope, WorkerId};
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Why a worker could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("worker {0} is unreachable")]
    Unreachable(WorkerId),

    #[error("worker {worker_id} rejected the job: {reason}")]
    Rejected { worker_id: WorkerId, reason: String },
}

/// Result type for deliveries.
pub type DeliveryResult = Result<(), TransportError>;

/// Future type for async deliveries.
pub type DeliveryFuture = Pin<Box<dyn Future<Output = DeliveryResult> + Send>>;

/// Hands a job envelope to a worker.
///
/// Success means the worker accepted the job; its result arrives later
/// through the engine's `resolve`.
pub trait WorkerTransport: Send + Sync + 'static {
    fn deliver(&self, worker_id: &WorkerId, envelope: JobEnvelope) -> DeliveryFuture;
}

/// A closure-based transport, for adapting an existing client.
pub struct FnTransport<F>
where
    F: Fn(&WorkerId, JobEnvelope) -> DeliveryFuture + Send + Sync + 'static,
{
    deliver: F,
}

impl<F> FnTransport<F>
where
    F: Fn(&WorkerId, JobEnvelope) -> DeliveryFuture + Send + Sync + 'static,
{
    pub fn new(deliver: F) -> Self {
        Self { deliver }
    }
}

impl<F> WorkerTransport for FnTransport<F>
where
    F: Fn(&WorkerId, JobEnvelope) -> DeliveryFuture + Send + Sync + 'static,
{
    fn deliver(&self, worker_id: &WorkerId, envelope: JobEnvelope) -> DeliveryFuture {
        (self.deliver)(worker_id, envelope)
    }
}

/// In-process transport: each connected worker owns an unbounded inbox.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    routes: RwLock<HashMap<WorkerId, mpsc::UnboundedSender<JobEnvelope>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the inbox for `worker_id`.
    pub fn connect(&self, worker_id: impl Into<WorkerId>) -> mpsc::UnboundedReceiver<JobEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(worker_id.into(), tx);
        rx
    }

    /// Drop the route; later deliveries fail as unreachable.
    pub fn disconnect(&self, worker_id: &WorkerId) -> bool {
        self.routes.write().remove(worker_id).is_some()
    }

    fn try_deliver(&self, worker_id: &WorkerId, envelope: JobEnvelope) -> DeliveryResult {
        let routes = self.routes.read();
        let tx = routes
            .get(worker_id)
            .ok_or_else(|| TransportError::Unreachable(worker_id.clone()))?;
        tx.send(envelope)
            .map_err(|_| TransportError::Unreachable(worker_id.clone()))
    }
}

impl WorkerTransport for ChannelTransport {
    fn deliver(&self, worker_id: &WorkerId, envelope: JobEnvelope) -> DeliveryFuture {
        let result = self.try_deliver(worker_id, envelope);
        Box::pin(async move { result })
    }
}
