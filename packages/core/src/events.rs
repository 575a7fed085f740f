//! Event types for observing the dispatch engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, OutcomeStatus, WorkerHealth, WorkerId};

/// Events emitted by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    // Job events
    /// A job was accepted by the queue.
    JobSubmitted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A job was handed to a worker.
    JobDispatched {
        job_id: JobId,
        worker_id: WorkerId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// No healthy worker was available; the job was held back.
    JobDeferred {
        job_id: JobId,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// An attempt failed or expired and the job went back to the queue.
    JobRetrying {
        job_id: JobId,
        attempt: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A job reached a terminal status.
    JobResolved {
        job_id: JobId,
        status: OutcomeStatus,
        latency_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<WorkerId>,
        timestamp: DateTime<Utc>,
    },
    /// A result arrived for a job that is no longer pending.
    LateResultDiscarded {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker joined the pool.
    WorkerRegistered {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    /// A worker's health changed.
    WorkerHealthChanged {
        worker_id: WorkerId,
        old_health: WorkerHealth,
        new_health: WorkerHealth,
        timestamp: DateTime<Utc>,
    },
}

impl DispatchEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DispatchEvent::JobSubmitted { timestamp, .. }
            | DispatchEvent::JobDispatched { timestamp, .. }
            | DispatchEvent::JobDeferred { timestamp, .. }
            | DispatchEvent::JobRetrying { timestamp, .. }
            | DispatchEvent::JobResolved { timestamp, .. }
            | DispatchEvent::LateResultDiscarded { timestamp, .. }
            | DispatchEvent::WorkerRegistered { timestamp, .. }
            | DispatchEvent::WorkerHealthChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            DispatchEvent::JobSubmitted { job_id, .. }
            | DispatchEvent::JobDispatched { job_id, .. }
            | DispatchEvent::JobDeferred { job_id, .. }
            | DispatchEvent::JobRetrying { job_id, .. }
            | DispatchEvent::JobResolved { job_id, .. }
            | DispatchEvent::LateResultDiscarded { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get the worker ID associated with this event, if any.
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            DispatchEvent::JobDispatched { worker_id, .. }
            | DispatchEvent::WorkerRegistered { worker_id, .. }
            | DispatchEvent::WorkerHealthChanged { worker_id, .. } => Some(worker_id),
            DispatchEvent::JobResolved { worker_id, .. } => worker_id.as_ref(),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            DispatchEvent::JobSubmitted { job_id, .. } => format!("Job {} submitted", job_id),
            DispatchEvent::JobDispatched {
                job_id,
                worker_id,
                attempt,
                ..
            } => format!("Job {} dispatched to {} (attempt {})", job_id, worker_id, attempt),
            DispatchEvent::JobDeferred {
                job_id, delay_ms, ..
            } => format!("Job {} deferred {}ms, no healthy worker", job_id, delay_ms),
            DispatchEvent::JobRetrying {
                job_id,
                attempt,
                reason,
                ..
            } => format!("Job {} retrying after attempt {}: {}", job_id, attempt, reason),
            DispatchEvent::JobResolved {
                job_id,
                status,
                latency_ms,
                ..
            } => format!("Job {} {} in {}ms", job_id, status, latency_ms),
            DispatchEvent::LateResultDiscarded { job_id, .. } => {
                format!("Late result for job {} discarded", job_id)
            }
            DispatchEvent::WorkerRegistered { worker_id, .. } => {
                format!("Worker {} registered", worker_id)
            }
            DispatchEvent::WorkerHealthChanged {
                worker_id,
                old_health,
                new_health,
                ..
            } => format!("Worker {} {} -> {}", worker_id, old_health, new_health),
        }
    }
}
