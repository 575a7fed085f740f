//! Latency and outcome accounting.

use std::collections::VecDeque;

use dispatch_core::{OutcomeRecord, OutcomeStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
struct StatusStats {
    count: u64,
    sum_ms: u64,
    max_ms: u64,
    /// Non-cumulative counts per bucket; the last slot is the overflow bucket.
    buckets: Vec<u64>,
}

#[derive(Debug)]
struct RecorderInner {
    completed: StatusStats,
    failed: StatusStats,
    timed_out: StatusStats,
    late_results: u64,
    recent: VecDeque<OutcomeRecord>,
}

impl RecorderInner {
    fn stats_mut(&mut self, status: OutcomeStatus) -> &mut StatusStats {
        match status {
            OutcomeStatus::Completed => &mut self.completed,
            OutcomeStatus::Failed => &mut self.failed,
            OutcomeStatus::TimedOut => &mut self.timed_out,
        }
    }

    fn stats(&self, status: OutcomeStatus) -> &StatusStats {
        match status {
            OutcomeStatus::Completed => &self.completed,
            OutcomeStatus::Failed => &self.failed,
            OutcomeStatus::TimedOut => &self.timed_out,
        }
    }
}

/// One cumulative histogram bucket. `le_ms` of `None` is `+Inf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    pub le_ms: Option<u64>,
    pub count: u64,
}

/// Count and latency distribution for one terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: OutcomeStatus,
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
    pub mean_ms: Option<f64>,
    pub buckets: Vec<BucketCount>,
}

/// Point-in-time view of everything recorded so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderSnapshot {
    pub statuses: Vec<StatusSummary>,
    pub late_results: u64,
    pub recent: Vec<OutcomeRecord>,
}

impl RecorderSnapshot {
    pub fn count(&self, status: OutcomeStatus) -> u64 {
        self.statuses
            .iter()
            .find(|s| s.status == status)
            .map_or(0, |s| s.count)
    }

    pub fn total(&self) -> u64 {
        self.statuses.iter().map(|s| s.count).sum()
    }
}

/// Append-only, thread-safe accumulation of terminal outcomes keyed by status.
///
/// Recording never fails and never blocks on anything but its own lock.
#[derive(Debug)]
pub struct OutcomeRecorder {
    inner: Mutex<RecorderInner>,
    bounds_ms: Vec<u64>,
    retention: usize,
}

impl OutcomeRecorder {
    /// `bounds_ms` are the upper bucket bounds; `retention` is how many recent
    /// records are kept.
    pub fn new(bounds_ms: Vec<u64>, retention: usize) -> Self {
        let empty = StatusStats {
            buckets: vec![0; bounds_ms.len() + 1],
            ..Default::default()
        };
        Self {
            inner: Mutex::new(RecorderInner {
                completed: empty.clone(),
                failed: empty.clone(),
                timed_out: empty,
                late_results: 0,
                recent: VecDeque::with_capacity(retention.min(4_096)),
            }),
            bounds_ms,
            retention,
        }
    }

    pub fn record(&self, record: OutcomeRecord) {
        let bucket = self
            .bounds_ms
            .iter()
            .position(|&le| record.latency_ms <= le)
            .unwrap_or(self.bounds_ms.len());

        let mut inner = self.inner.lock();
        let stats = inner.stats_mut(record.status);
        stats.count += 1;
        stats.sum_ms = stats.sum_ms.saturating_add(record.latency_ms);
        stats.max_ms = stats.max_ms.max(record.latency_ms);
        if let Some(slot) = stats.buckets.get_mut(bucket) {
            *slot += 1;
        }

        if self.retention > 0 {
            if inner.recent.len() == self.retention {
                inner.recent.pop_front();
            }
            inner.recent.push_back(record);
        }
    }

    /// Count a result that arrived for a job no longer pending.
    pub fn record_late_result(&self) {
        self.inner.lock().late_results += 1;
    }

    pub fn count(&self, status: OutcomeStatus) -> u64 {
        self.inner.lock().stats(status).count
    }

    pub fn late_results(&self) -> u64 {
        self.inner.lock().late_results
    }

    /// Retained records, oldest first.
    pub fn recent(&self) -> Vec<OutcomeRecord> {
        self.inner.lock().recent.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        let inner = self.inner.lock();
        let statuses = OutcomeStatus::ALL
            .iter()
            .map(|&status| {
                let stats = inner.stats(status);
                let mut cumulative = 0;
                let buckets = stats
                    .buckets
                    .iter()
                    .enumerate()
                    .map(|(i, n)| {
                        cumulative += n;
                        BucketCount {
                            le_ms: self.bounds_ms.get(i).copied(),
                            count: cumulative,
                        }
                    })
                    .collect();
                StatusSummary {
                    status,
                    count: stats.count,
                    sum_ms: stats.sum_ms,
                    max_ms: stats.max_ms,
                    mean_ms: (stats.count > 0).then(|| stats.sum_ms as f64 / stats.count as f64),
                    buckets,
                }
            })
            .collect();

        RecorderSnapshot {
            statuses,
            late_results: inner.late_results,
            recent: inner.recent.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dispatch_core::JobId;

    fn record(status: OutcomeStatus, latency_ms: u64) -> OutcomeRecord {
        OutcomeRecord {
            job_id: JobId::new(),
            status,
            latency_ms,
            worker_id: None,
            attempts: 1,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn counts_are_keyed_by_status() {
        let recorder = OutcomeRecorder::new(vec![100, 1_000], 16);
        recorder.record(record(OutcomeStatus::Completed, 10));
        recorder.record(record(OutcomeStatus::Completed, 20));
        recorder.record(record(OutcomeStatus::TimedOut, 2_000));
        recorder.record_late_result();

        let snap = recorder.snapshot();
        assert_eq!(snap.count(OutcomeStatus::Completed), 2);
        assert_eq!(snap.count(OutcomeStatus::TimedOut), 1);
        assert_eq!(snap.count(OutcomeStatus::Failed), 0);
        assert_eq!(snap.total(), 3);
        assert_eq!(snap.late_results, 1);
    }

    #[test]
    fn buckets_are_cumulative_with_overflow() {
        let recorder = OutcomeRecorder::new(vec![100, 1_000], 16);
        for latency in [50, 100, 500, 5_000] {
            recorder.record(record(OutcomeStatus::Completed, latency));
        }

        let snap = recorder.snapshot();
        let completed = &snap.statuses[0];
        assert_eq!(completed.status, OutcomeStatus::Completed);
        assert_eq!(
            completed.buckets,
            vec![
                BucketCount { le_ms: Some(100), count: 2 },
                BucketCount { le_ms: Some(1_000), count: 3 },
                BucketCount { le_ms: None, count: 4 },
            ]
        );
        assert_eq!(completed.max_ms, 5_000);
        assert_eq!(completed.mean_ms, Some(1_412.5));
    }

    #[test]
    fn retention_keeps_most_recent() {
        let recorder = OutcomeRecorder::new(vec![], 2);
        for latency in [1, 2, 3] {
            recorder.record(record(OutcomeStatus::Failed, latency));
        }
        let recent: Vec<u64> = recorder.recent().iter().map(|r| r.latency_ms).collect();
        assert_eq!(recent, vec![2, 3]);
        assert_eq!(recorder.count(OutcomeStatus::Failed), 3);
    }
}
