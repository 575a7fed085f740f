//! Job domain types for units of work moving through the dispatcher.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::WorkerId;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Ulid> for JobId {
    fn from(id: Ulid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job currently sits in its lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue for a dispatcher.
    #[default]
    Queued,
    /// Handed to a worker; a pending completion exists for it.
    Dispatched {
        worker_id: WorkerId,
        dispatched_at: DateTime<Utc>,
    },
    /// A previous attempt failed or expired and the job is going back to the queue.
    Retrying { attempt: u32, reason: String },
    /// Terminal: the worker posted a result.
    Completed,
    /// Terminal: dispatch or worker failure with the retry budget exhausted.
    Failed,
    /// Terminal: no result arrived before the deadline on the final attempt.
    TimedOut,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }

    /// Get a simple state string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Dispatched { .. } => "dispatched",
            JobState::Retrying { .. } => "retrying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed-out",
        }
    }
}

/// A job is one unit of cross-stage work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Opaque payload forwarded to the worker.
    pub payload: serde_json::Value,
    /// Current state.
    pub state: JobState,
    /// Number of dispatch attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Number of times the job was held back because no worker was healthy.
    #[serde(default)]
    pub deferrals: u32,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Deadline for a single dispatched attempt, in milliseconds.
    pub timeout_ms: u64,
    /// Error text from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job with a generated id.
    pub fn new(payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Queued,
            attempts: 0,
            deferrals: 0,
            max_retries: 2,
            timeout_ms: 60_000,
            last_error: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Use a caller-assigned id.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Set the retry budget for this job.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-attempt timeout for this job.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether another attempt fits in the retry budget.
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Whether the job has waited longer than its own timeout since submission.
    pub fn expired_since_submit(&self, now: DateTime<Utc>) -> bool {
        let waited = (now - self.submitted_at).num_milliseconds().max(0) as u64;
        waited >= self.timeout_ms
    }

    /// Move the job to a new state and bump `updated_at`.
    pub fn transition(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Build the envelope delivered to a worker.
    pub fn envelope(&self) -> JobEnvelope {
        JobEnvelope {
            job_id: self.id,
            payload: self.payload.clone(),
        }
    }
}

/// Request envelope delivered to the selected worker's endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub payload: serde_json::Value,
}

/// What a worker posts back to the resolution endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReport {
    pub fn success(job_id: JobId, result: serde_json::Value) -> Self {
        Self {
            job_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// An `error` field wins over `result`; a report with neither is an empty success.
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    #[test]
    fn retry_budget_counts_first_attempt() {
        let mut job = Job::new(json!({})).with_max_retries(1);
        job.attempts = 1;
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(!job.can_retry());
    }

    #[test]
    fn expiry_is_measured_from_submission() {
        let job = Job::new(json!(null)).with_timeout(Duration::from_millis(500));
        assert!(!job.expired_since_submit(job.submitted_at));
        assert!(job.expired_since_submit(job.submitted_at + TimeDelta::milliseconds(500)));
    }

    #[test]
    fn envelope_uses_camel_case() -> Result<(), serde_json::Error> {
        let job = Job::new(json!({"text": "hello"}));
        let wire = serde_json::to_value(job.envelope())?;
        assert_eq!(wire["jobId"], json!(job.id.to_string()));
        assert_eq!(wire["payload"]["text"], json!("hello"));
        Ok(())
    }

    #[test]
    fn report_error_takes_precedence() -> Result<(), serde_json::Error> {
        let id = JobId::new();
        let raw = format!(r#"{{"jobId":"{id}","result":1,"error":"boom"}}"#);
        let report: WorkerReport = serde_json::from_str(&raw)?;
        assert_eq!(report.into_result(), Err("boom".to_string()));
        Ok(())
    }
}
