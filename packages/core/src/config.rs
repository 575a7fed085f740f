//! Dispatch engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the dispatcher picks a worker for the next job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Rotate through healthy workers in registration order.
    #[default]
    RoundRobin,
    /// Healthy worker with the fewest in-flight jobs, earliest registered on ties.
    LeastLoaded,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" | "rr" => Ok(SelectionPolicy::RoundRobin),
            "least_loaded" | "least-loaded" | "ll" => Ok(SelectionPolicy::LeastLoaded),
            other => Err(format!("unknown selection policy {other}")),
        }
    }
}

/// Configuration for the dispatch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline for a single dispatched attempt (milliseconds).
    pub per_job_timeout_ms: u64,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// First deferral delay when no worker is healthy (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound on the deferral delay (milliseconds).
    pub backoff_cap_ms: u64,
    /// Consecutive unacknowledged jobs before a worker is marked unhealthy.
    pub unhealthy_after_failures: u32,
    /// Worker pool membership, in registration order.
    pub workers: Vec<String>,
    /// Number of dispatcher actors pulling from the shared queue.
    pub dispatchers: u32,
    /// Maximum number of queued jobs; `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    /// How often the tracker looks for expired completions (milliseconds).
    pub sweep_interval_ms: u64,
    /// How often workers are probed (milliseconds).
    pub health_check_interval_ms: u64,
    /// Outcome records kept for reporting.
    pub outcome_retention: usize,
    /// Upper bounds of the latency histogram buckets (milliseconds).
    pub latency_buckets_ms: Vec<u64>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Worker selection policy.
    pub selection: SelectionPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            per_job_timeout_ms: 60_000,
            max_retries: 2,
            backoff_base_ms: 50,
            backoff_cap_ms: 2_000,
            unhealthy_after_failures: 3,
            workers: vec![
                "replica-1".to_string(),
                "replica-2".to_string(),
                "replica-3".to_string(),
            ],
            dispatchers: 2,
            max_queue_size: None,
            sweep_interval_ms: 100,
            health_check_interval_ms: 5_000,
            outcome_retention: 1_024,
            latency_buckets_ms: vec![100, 500, 1_000, 5_000, 10_000, 30_000, 60_000],
            event_capacity: 1_024,
            selection: SelectionPolicy::RoundRobin,
        }
    }
}

impl DispatchConfig {
    pub fn per_job_timeout(&self) -> Duration {
        Duration::from_millis(self.per_job_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Deferral delay after `deferrals` previous deferrals: `base * 2^n`, capped.
    pub fn backoff(&self, deferrals: u32) -> Duration {
        let factor = 1u64.checked_shl(deferrals.min(63)).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_cap_ms))
    }

    /// Upper bound on how long a caller should wait for a job with the given
    /// per-attempt timeout: every attempt may expire, plus one sweep of slack each.
    pub fn caller_wait_bound(&self, timeout: Duration) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        (timeout + self.sweep_interval() * 2) * attempts
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.per_job_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "per_job_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.dispatchers == 0 {
            return Err(ConfigError::Invalid(
                "dispatchers must be at least one".into(),
            ));
        }
        if self.unhealthy_after_failures == 0 {
            return Err(ConfigError::Invalid(
                "unhealthy_after_failures must be at least one".into(),
            ));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be greater than zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be greater than zero".into(),
            ));
        }
        if self.max_queue_size == Some(0) {
            return Err(ConfigError::Invalid(
                "max_queue_size must be greater than zero when set".into(),
            ));
        }
        if !self.latency_buckets_ms.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConfigError::Invalid(
                "latency_buckets_ms must be strictly increasing".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.workers.iter().find(|w| !seen.insert(w.as_str())) {
            return Err(ConfigError::Invalid(format!("worker {dup} listed twice")));
        }
        Ok(())
    }

    /// Build a config from environment variables, starting from the defaults.
    ///
    /// Recognized variables:
    /// - `DISPATCH_PER_JOB_TIMEOUT_MS`
    /// - `DISPATCH_MAX_RETRIES`
    /// - `DISPATCH_BACKOFF_BASE_MS`, `DISPATCH_BACKOFF_CAP_MS`
    /// - `DISPATCH_UNHEALTHY_AFTER_FAILURES`
    /// - `DISPATCH_WORKERS` (comma separated replica names)
    /// - `DISPATCH_DISPATCHERS`
    /// - `DISPATCH_MAX_QUEUE_SIZE` (empty or unset for unbounded)
    /// - `DISPATCH_SWEEP_INTERVAL_MS`, `DISPATCH_HEALTH_CHECK_INTERVAL_MS`
    /// - `DISPATCH_OUTCOME_RETENTION`
    /// - `DISPATCH_LATENCY_BUCKETS_MS` (comma separated)
    /// - `DISPATCH_SELECTION` (`round_robin` or `least_loaded`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`DispatchConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).and_then(non_empty);
        let mut cfg = Self::default();

        if let Some(v) = get("DISPATCH_PER_JOB_TIMEOUT_MS") {
            cfg.per_job_timeout_ms = parse("DISPATCH_PER_JOB_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("DISPATCH_MAX_RETRIES") {
            cfg.max_retries = parse("DISPATCH_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("DISPATCH_BACKOFF_BASE_MS") {
            cfg.backoff_base_ms = parse("DISPATCH_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = get("DISPATCH_BACKOFF_CAP_MS") {
            cfg.backoff_cap_ms = parse("DISPATCH_BACKOFF_CAP_MS", &v)?;
        }
        if let Some(v) = get("DISPATCH_UNHEALTHY_AFTER_FAILURES") {
            cfg.unhealthy_after_failures = parse("DISPATCH_UNHEALTHY_AFTER_FAILURES", &v)?;
        }
        if let Some(v) = get("DISPATCH_WORKERS") {
            cfg.workers = split_list(&v);
        }
        if let Some(v) = get("DISPATCH_DISPATCHERS") {
            cfg.dispatchers = parse("DISPATCH_DISPATCHERS", &v)?;
        }
        if let Some(v) = get("DISPATCH_MAX_QUEUE_SIZE") {
            cfg.max_queue_size = Some(parse("DISPATCH_MAX_QUEUE_SIZE", &v)?);
        }
        if let Some(v) = get("DISPATCH_SWEEP_INTERVAL_MS") {
            cfg.sweep_interval_ms = parse("DISPATCH_SWEEP_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("DISPATCH_HEALTH_CHECK_INTERVAL_MS") {
            cfg.health_check_interval_ms = parse("DISPATCH_HEALTH_CHECK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("DISPATCH_OUTCOME_RETENTION") {
            cfg.outcome_retention = parse("DISPATCH_OUTCOME_RETENTION", &v)?;
        }
        if let Some(v) = get("DISPATCH_LATENCY_BUCKETS_MS") {
            cfg.latency_buckets_ms = split_list(&v)
                .iter()
                .map(|b| parse("DISPATCH_LATENCY_BUCKETS_MS", b))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = get("DISPATCH_SELECTION") {
            cfg.selection = v.parse().map_err(|reason| ConfigError::InvalidEnv {
                var: "DISPATCH_SELECTION".into(),
                value: v.clone(),
                reason,
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(DispatchConfig::default().validate(), Ok(()));
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let cfg = DispatchConfig {
            backoff_base_ms: 100,
            backoff_cap_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
        assert_eq!(cfg.backoff(4), Duration::from_millis(1_000));
        assert_eq!(cfg.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn env_overrides_defaults() -> Result<(), ConfigError> {
        let cfg = DispatchConfig::from_lookup(lookup(&[
            ("DISPATCH_PER_JOB_TIMEOUT_MS", "2000"),
            ("DISPATCH_MAX_RETRIES", "0"),
            ("DISPATCH_WORKERS", "a, b ,,c"),
            ("DISPATCH_MAX_QUEUE_SIZE", "16"),
            ("DISPATCH_SELECTION", "least-loaded"),
            ("DISPATCH_LATENCY_BUCKETS_MS", "10,20,40"),
        ]))?;
        assert_eq!(cfg.per_job_timeout_ms, 2_000);
        assert_eq!(cfg.max_retries, 0);
        assert_eq!(cfg.workers, vec!["a", "b", "c"]);
        assert_eq!(cfg.max_queue_size, Some(16));
        assert_eq!(cfg.selection, SelectionPolicy::LeastLoaded);
        assert_eq!(cfg.latency_buckets_ms, vec![10, 20, 40]);
        assert_eq!(cfg.dispatchers, DispatchConfig::default().dispatchers);
        Ok(())
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let err = DispatchConfig::from_lookup(lookup(&[("DISPATCH_MAX_RETRIES", "many")]));
        assert!(matches!(
            err,
            Err(ConfigError::InvalidEnv { ref var, .. }) if var == "DISPATCH_MAX_RETRIES"
        ));
    }

    #[test]
    fn rejects_duplicate_workers_and_inverted_backoff() {
        let dup = DispatchConfig {
            workers: vec!["a".into(), "a".into()],
            ..Default::default()
        };
        assert!(dup.validate().is_err());

        let inverted = DispatchConfig {
            backoff_base_ms: 5_000,
            backoff_cap_ms: 100,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn caller_wait_covers_every_attempt() {
        let cfg = DispatchConfig {
            max_retries: 2,
            sweep_interval_ms: 50,
            ..Default::default()
        };
        assert_eq!(
            cfg.caller_wait_bound(Duration::from_millis(1_000)),
            Duration::from_millis(3_300)
        );
    }
}
