//! Worker registry: pool membership, health and in-flight accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dispatch_core::{DispatchError, DispatchEvent, SelectionPolicy, Worker, WorkerHealth, WorkerId};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// In-flight counter shared outside the membership lock.
#[derive(Debug)]
struct Slot {
    in_flight: AtomicU64,
}

#[derive(Debug)]
struct Entry {
    id: WorkerId,
    health: WorkerHealth,
    last_seen: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    registered_at: DateTime<Utc>,
    slot: Arc<Slot>,
}

impl Entry {
    fn snapshot(&self) -> Worker {
        Worker {
            id: self.id.clone(),
            health: self.health,
            last_seen: self.last_seen,
            in_flight: self.slot.in_flight.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures,
            registered_at: self.registered_at,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Registration order.
    entries: Vec<Entry>,
    /// Round-robin cursor; only ever moves forward.
    cursor: usize,
}

impl Inner {
    fn position(&self, id: &WorkerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    fn entry_mut(&mut self, id: &WorkerId) -> Result<&mut Entry, DispatchError> {
        self.entries
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| DispatchError::WorkerNotFound(id.clone()))
    }
}

/// Tracks the pool of interchangeable workers.
///
/// Membership, health and the round-robin cursor live behind one lock; the
/// per-worker in-flight counters are atomics so `begin_job`/`end_job` only
/// take the read side.
#[derive(Debug)]
pub struct WorkerRegistry {
    inner: RwLock<Inner>,
    failure_threshold: u32,
    event_tx: Option<broadcast::Sender<DispatchEvent>>,
}

impl WorkerRegistry {
    /// Create an empty registry. `failure_threshold` consecutive unacknowledged
    /// jobs mark a worker unhealthy.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            failure_threshold: failure_threshold.max(1),
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<DispatchEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn broadcast(&self, event: DispatchEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Add a worker at the end of the rotation.
    pub fn register(&self, worker: Worker) -> Result<(), DispatchError> {
        let worker_id = worker.id.clone();
        {
            let mut inner = self.inner.write();
            if inner.position(&worker.id).is_some() {
                return Err(DispatchError::DuplicateWorker(worker.id));
            }
            inner.entries.push(Entry {
                id: worker.id,
                health: worker.health,
                last_seen: worker.last_seen,
                consecutive_failures: 0,
                registered_at: worker.registered_at,
                slot: Arc::new(Slot {
                    in_flight: AtomicU64::new(0),
                }),
            });
        }

        tracing::info!(worker_id = %worker_id, health = %worker.health, "Worker registered");
        self.broadcast(DispatchEvent::WorkerRegistered {
            worker_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Remove a worker from the pool. Jobs already dispatched to it still
    /// resolve or expire through the tracker.
    pub fn deregister(&self, id: &WorkerId) -> Result<Worker, DispatchError> {
        let mut inner = self.inner.write();
        let pos = inner
            .position(id)
            .ok_or_else(|| DispatchError::WorkerNotFound(id.clone()))?;
        let entry = inner.entries.remove(pos);
        tracing::info!(worker_id = %id, "Worker deregistered");
        Ok(entry.snapshot())
    }

    pub fn mark_healthy(&self, id: &WorkerId) -> Result<(), DispatchError> {
        self.set_health(id, WorkerHealth::Healthy).map(|_| ())
    }

    pub fn mark_unhealthy(&self, id: &WorkerId) -> Result<(), DispatchError> {
        self.set_health(id, WorkerHealth::Unhealthy).map(|_| ())
    }

    fn set_health(&self, id: &WorkerId, health: WorkerHealth) -> Result<WorkerHealth, DispatchError> {
        let old = {
            let mut inner = self.inner.write();
            let entry = inner.entry_mut(id)?;
            let old = entry.health;
            entry.health = health;
            if health == WorkerHealth::Healthy {
                entry.consecutive_failures = 0;
                entry.last_seen = Some(Utc::now());
            }
            old
        };

        if old != health {
            tracing::info!(worker_id = %id, old = %old, new = %health, "Worker health changed");
            self.broadcast(DispatchEvent::WorkerHealthChanged {
                worker_id: id.clone(),
                old_health: old,
                new_health: health,
                timestamp: Utc::now(),
            });
        }
        Ok(old)
    }

    /// Healthy workers in registration order.
    pub fn list_healthy(&self) -> Vec<WorkerId> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| e.health.is_dispatchable())
            .map(|e| e.id.clone())
            .collect()
    }

    /// Pick a worker for the next job, or `None` if nobody is healthy.
    pub fn select(&self, policy: SelectionPolicy) -> Option<WorkerId> {
        match policy {
            SelectionPolicy::RoundRobin => self.select_round_robin(),
            SelectionPolicy::LeastLoaded => self.select_least_loaded(),
        }
    }

    /// Walk from the cursor over at most one full cycle, skipping workers that
    /// are not healthy, and leave the cursor just past the chosen one.
    fn select_round_robin(&self) -> Option<WorkerId> {
        let mut inner = self.inner.write();
        let n = inner.entries.len();
        if n == 0 {
            return None;
        }

        let start = inner.cursor;
        for step in 0..n {
            let idx = start.wrapping_add(step) % n;
            if inner.entries[idx].health.is_dispatchable() {
                inner.cursor = start.wrapping_add(step + 1);
                return Some(inner.entries[idx].id.clone());
            }
        }
        None
    }

    fn select_least_loaded(&self) -> Option<WorkerId> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| e.health.is_dispatchable())
            .min_by_key(|e| e.slot.in_flight.load(Ordering::Acquire))
            .map(|e| e.id.clone())
    }

    fn slot(&self, id: &WorkerId) -> Option<Arc<Slot>> {
        self.inner
            .read()
            .entries
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.slot.clone())
    }

    /// Count a job handed to `id`. Returns the new in-flight count.
    pub fn begin_job(&self, id: &WorkerId) -> Option<u64> {
        self.slot(id)
            .map(|slot| slot.in_flight.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Count a job resolved on `id`. Never goes below zero.
    pub fn end_job(&self, id: &WorkerId) -> Option<u64> {
        let slot = self.slot(id)?;
        match slot
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(prev) => Some(prev - 1),
            Err(_) => {
                tracing::warn!(worker_id = %id, "In-flight count already zero");
                Some(0)
            }
        }
    }

    /// Record an acknowledged job: clears the failure streak.
    pub fn record_success(&self, id: &WorkerId) {
        let mut inner = self.inner.write();
        if let Ok(entry) = inner.entry_mut(id) {
            entry.consecutive_failures = 0;
            entry.last_seen = Some(Utc::now());
        }
    }

    /// Record an unacknowledged job. Returns true if this failure marked the
    /// worker unhealthy.
    pub fn record_failure(&self, id: &WorkerId) -> bool {
        let tripped = {
            let mut inner = self.inner.write();
            let Ok(entry) = inner.entry_mut(id) else {
                return false;
            };
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.consecutive_failures >= self.failure_threshold
                && entry.health != WorkerHealth::Unhealthy
        };

        if tripped {
            tracing::warn!(
                worker_id = %id,
                threshold = self.failure_threshold,
                "Worker failed too many jobs in a row"
            );
            let _ = self.set_health(id, WorkerHealth::Unhealthy);
        }
        tripped
    }

    pub fn in_flight(&self, id: &WorkerId) -> Option<u64> {
        self.slot(id).map(|s| s.in_flight.load(Ordering::Acquire))
    }

    /// In-flight jobs across the pool.
    pub fn total_in_flight(&self) -> u64 {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| e.slot.in_flight.load(Ordering::Acquire))
            .sum()
    }

    pub fn get(&self, id: &WorkerId) -> Option<Worker> {
        self.inner
            .read()
            .entries
            .iter()
            .find(|e| &e.id == id)
            .map(Entry::snapshot)
    }

    /// Snapshot of every worker in registration order.
    pub fn workers(&self) -> Vec<Worker> {
        self.inner.read().entries.iter().map(Entry::snapshot).collect()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.inner.read().entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    fn pool(names: &[&str]) -> WorkerRegistry {
        let registry = WorkerRegistry::new(2);
        for name in names {
            registry
                .register(Worker::new(*name).with_health(WorkerHealth::Healthy))
                .unwrap();
        }
        registry
    }

    fn id(s: &str) -> WorkerId {
        WorkerId::from(s)
    }

    #[test]
    fn round_robin_cycles_in_registration_order() {
        let registry = pool(&["w1", "w2", "w3"]);
        let picks: Vec<_> = (0..6)
            .map(|_| registry.select(SelectionPolicy::RoundRobin).unwrap())
            .collect();
        assert_eq!(
            picks,
            vec![id("w1"), id("w2"), id("w3"), id("w1"), id("w2"), id("w3")]
        );
    }

    #[test]
    fn round_robin_skips_unhealthy_and_resumes() {
        let registry = pool(&["w1", "w2", "w3"]);
        registry.mark_unhealthy(&id("w2")).unwrap();
        let picks: Vec<_> = (0..4)
            .map(|_| registry.select(SelectionPolicy::RoundRobin).unwrap())
            .collect();
        assert_eq!(picks, vec![id("w1"), id("w3"), id("w1"), id("w3")]);

        registry.mark_healthy(&id("w2")).unwrap();
        let picks: Vec<_> = (0..3)
            .map(|_| registry.select(SelectionPolicy::RoundRobin).unwrap())
            .collect();
        assert!(picks.contains(&id("w2")));
    }

    #[test]
    fn no_healthy_worker_selects_nothing() {
        let registry = pool(&["w1", "w2"]);
        registry.mark_unhealthy(&id("w1")).unwrap();
        registry.mark_unhealthy(&id("w2")).unwrap();
        assert_eq!(registry.select(SelectionPolicy::RoundRobin), None);
        assert_eq!(registry.select(SelectionPolicy::LeastLoaded), None);
        assert!(WorkerRegistry::new(1).select(SelectionPolicy::RoundRobin).is_none());
    }

    #[test]
    fn unknown_workers_are_not_dispatchable() {
        let registry = WorkerRegistry::new(1);
        registry.register(Worker::new("w1")).unwrap();
        assert!(registry.list_healthy().is_empty());
        assert_eq!(registry.select(SelectionPolicy::RoundRobin), None);
    }

    #[test]
    fn least_loaded_prefers_idle_then_registration_order() {
        let registry = pool(&["w1", "w2", "w3"]);
        registry.begin_job(&id("w1"));
        registry.begin_job(&id("w2"));
        assert_eq!(registry.select(SelectionPolicy::LeastLoaded), Some(id("w3")));
        registry.begin_job(&id("w3"));
        assert_eq!(registry.select(SelectionPolicy::LeastLoaded), Some(id("w1")));
    }

    #[test]
    fn in_flight_never_goes_negative() {
        let registry = pool(&["w1"]);
        assert_eq!(registry.begin_job(&id("w1")), Some(1));
        assert_eq!(registry.end_job(&id("w1")), Some(0));
        assert_eq!(registry.end_job(&id("w1")), Some(0));
        assert_eq!(registry.in_flight(&id("w1")), Some(0));
        assert_eq!(registry.begin_job(&id("missing")), None);
    }

    #[test]
    fn consecutive_failures_mark_unhealthy_and_success_resets() {
        let registry = pool(&["w1"]);
        assert!(!registry.record_failure(&id("w1")));
        registry.record_success(&id("w1"));
        assert!(!registry.record_failure(&id("w1")));
        assert!(registry.record_failure(&id("w1")));
        assert_eq!(registry.get(&id("w1")).unwrap().health, WorkerHealth::Unhealthy);

        registry.mark_healthy(&id("w1")).unwrap();
        assert_eq!(registry.get(&id("w1")).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn duplicate_and_unknown_ids_are_errors() {
        let registry = pool(&["w1"]);
        assert_eq!(
            registry.register(Worker::new("w1")),
            Err(DispatchError::DuplicateWorker(id("w1")))
        );
        assert_eq!(
            registry.mark_healthy(&id("nope")),
            Err(DispatchError::WorkerNotFound(id("nope")))
        );
    }

    #[test]
    fn list_healthy_keeps_registration_order() {
        let registry = pool(&["c", "a", "b"]);
        registry.mark_unhealthy(&id("a")).unwrap();
        assert_eq!(registry.list_healthy(), vec![id("c"), id("b")]);
        registry.deregister(&id("c")).unwrap();
        assert_eq!(registry.ids(), vec![id("a"), id("b")]);
    }
}
