//! Terminal outcomes reported to callers and to the recorder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, WorkerId};

/// Final status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    TimedOut,
}

impl OutcomeStatus {
    pub const ALL: [OutcomeStatus; 3] = [
        OutcomeStatus::Completed,
        OutcomeStatus::Failed,
        OutcomeStatus::TimedOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::TimedOut => "timed-out",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable terminal record of a job, created exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub job_id: JobId,
    pub status: OutcomeStatus,
    /// Submission to resolution, in milliseconds.
    pub latency_ms: u64,
    /// Worker holding the job when it resolved, if it was ever dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// What the caller's notification handle receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub record: OutcomeRecord,
    /// Worker result for completed jobs.
    pub result: Option<serde_json::Value>,
}

/// Response shape of the caller-facing `submit_job` facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
}

impl SubmitResponse {
    /// The caller stopped waiting; the job itself keeps running in the tracker.
    pub fn caller_timed_out(job_id: JobId, latency_ms: u64) -> Self {
        Self {
            job_id,
            status: OutcomeStatus::TimedOut,
            result: None,
            error: Some("caller wait expired before the job resolved".to_string()),
            latency_ms,
            worker_id: None,
        }
    }
}

impl From<Completion> for SubmitResponse {
    fn from(completion: Completion) -> Self {
        let Completion { record, result } = completion;
        Self {
            job_id: record.job_id,
            status: record.status,
            result,
            error: record.error,
            latency_ms: record.latency_ms,
            worker_id: record.worker_id,
        }
    }
}
