//! Worker domain types for the replica pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an interchangeable processing replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness of a worker as seen by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Registered but not yet confirmed by a probe.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl WorkerHealth {
    /// Only healthy workers receive jobs.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, WorkerHealth::Healthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerHealth::Unknown => "unknown",
            WorkerHealth::Healthy => "healthy",
            WorkerHealth::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Replica name.
    pub id: WorkerId,
    /// Current health.
    pub health: WorkerHealth,
    /// Last time the worker acknowledged a job or passed a probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Jobs dispatched to this worker and not yet resolved.
    pub in_flight: u64,
    /// Unacknowledged jobs in a row.
    pub consecutive_failures: u32,
    /// When the worker joined the pool.
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Create a worker in the `Unknown` state.
    pub fn new(id: impl Into<WorkerId>) -> Self {
        Self {
            id: id.into(),
            health: WorkerHealth::Unknown,
            last_seen: None,
            in_flight: 0,
            consecutive_failures: 0,
            registered_at: Utc::now(),
        }
    }

    /// Set the initial health.
    pub fn with_health(mut self, health: WorkerHealth) -> Self {
        self.health = health;
        self
    }
}
