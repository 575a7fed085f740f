//! Caller-facing handle over a running dispatch engine.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use dispatch_core::{
    Completion, ConfigError, DispatchConfig, DispatchError, DispatchEvent, Job, JobId,
    OutcomeStatus, Result, SubmitResponse, Worker, WorkerHealth, WorkerReport,
};
use parking_lot::Mutex;
use ractor::ActorRef;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::health::HealthProbe;
use crate::messages::{
    JobTicket, QueueMessage, ResolveOutcome, SupervisorMessage, TrackerMessage, ask,
};
use crate::recorder::{OutcomeRecorder, RecorderSnapshot};
use crate::registry::WorkerRegistry;
use crate::supervisor::{SupervisorArgs, start_supervisor};
use crate::transport::WorkerTransport;

/// Serializable view of the engine: outcomes, the active-jobs gauge and
/// per-worker load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub outcomes: RecorderSnapshot,
    pub active_jobs: u64,
    pub workers: Vec<Worker>,
}

/// Pending notification for one submitted job.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: JobId,
    submitted: Instant,
    rx: oneshot::Receiver<Completion>,
}

impl JobHandle {
    /// Wait for the terminal outcome with no bound.
    pub async fn completion(self) -> Result<Completion> {
        self.rx
            .await
            .map_err(|_| DispatchError::Actor("engine dropped the job".into()))
    }

    /// Wait up to `bound`. Giving up only ends the wait: the job keeps
    /// running and its outcome is still recorded.
    pub async fn wait(self, bound: Duration) -> SubmitResponse {
        let job_id = self.job_id;
        let submitted = self.submitted;
        let elapsed_ms = || u64::try_from(submitted.elapsed().as_millis()).unwrap_or(u64::MAX);

        match tokio::time::timeout(bound, self.rx).await {
            Ok(Ok(completion)) => completion.into(),
            Ok(Err(_)) => SubmitResponse {
                job_id,
                status: OutcomeStatus::Failed,
                result: None,
                error: Some("engine shut down before the job resolved".into()),
                latency_ms: elapsed_ms(),
                worker_id: None,
            },
            Err(_) => SubmitResponse::caller_timed_out(job_id, elapsed_ms()),
        }
    }
}

/// Builder for [`DispatchEngine`].
pub struct EngineBuilder {
    config: DispatchConfig,
    transport: Option<Arc<dyn WorkerTransport>>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl EngineBuilder {
    /// How envelopes reach workers. Required.
    pub fn transport(mut self, transport: Arc<dyn WorkerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Periodic health checks. Without a probe, configured workers start
    /// healthy and only delivery failures and timeouts change that.
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate the configuration, register the configured workers and start
    /// the actors.
    pub async fn start(self) -> Result<DispatchEngine> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| ConfigError::Invalid("a worker transport is required".into()))?;

        let config = Arc::new(self.config);
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let registry = Arc::new(
            WorkerRegistry::new(config.unhealthy_after_failures).with_event_tx(event_tx.clone()),
        );

        // With a probe, the monitor's first check decides who is healthy.
        let initial = if self.probe.is_some() {
            WorkerHealth::Unknown
        } else {
            WorkerHealth::Healthy
        };
        for id in &config.workers {
            registry.register(Worker::new(id.as_str()).with_health(initial))?;
        }

        let recorder = Arc::new(OutcomeRecorder::new(
            config.latency_buckets_ms.clone(),
            config.outcome_retention,
        ));
        let held = Arc::new(AtomicUsize::new(0));

        let (supervisor, handle) = start_supervisor(SupervisorArgs {
            config: config.clone(),
            registry: registry.clone(),
            recorder: recorder.clone(),
            transport,
            probe: self.probe,
            event_tx: event_tx.clone(),
            held,
        })
        .await
        .map_err(|e| DispatchError::Actor(format!("Failed to start supervisor: {}", e)))?;

        let actors = ask(&supervisor, |reply| SupervisorMessage::Actors { reply }).await?;

        Ok(DispatchEngine {
            supervisor,
            queue: actors.queue,
            tracker: actors.tracker,
            registry,
            recorder,
            config,
            event_tx,
            handle: Arc::new(Mutex::new(Some(handle))),
        })
    }
}

/// Handle to a running engine. Cheap to clone; every clone drives the same actors.
#[derive(Clone)]
pub struct DispatchEngine {
    supervisor: ActorRef<SupervisorMessage>,
    queue: ActorRef<QueueMessage>,
    tracker: ActorRef<TrackerMessage>,
    registry: Arc<WorkerRegistry>,
    recorder: Arc<OutcomeRecorder>,
    config: Arc<DispatchConfig>,
    event_tx: broadcast::Sender<DispatchEvent>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DispatchEngine {
    pub fn builder(config: DispatchConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            transport: None,
            probe: None,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<OutcomeRecorder> {
        &self.recorder
    }

    /// A job carrying the configured retry budget and timeout.
    pub fn new_job(&self, payload: serde_json::Value) -> Job {
        Job::new(payload)
            .with_max_retries(self.config.max_retries)
            .with_timeout(self.config.per_job_timeout())
    }

    /// Enqueue a job. Fails fast when the queue is full or shut down.
    pub async fn submit(&self, job: Job) -> Result<JobHandle> {
        let (ticket, rx) = JobTicket::new(job);
        let job_id = ticket.id();
        let submitted = ticket.submitted;

        ask(&self.queue, |reply| QueueMessage::Submit {
            ticket: Box::new(ticket),
            reply,
        })
        .await??;

        Ok(JobHandle {
            job_id,
            submitted,
            rx,
        })
    }

    /// Submit a payload and wait for its outcome.
    ///
    /// `timeout` bounds the caller's wait and is also the job's per-attempt
    /// timeout. Past it the response reports `timed-out` while the job keeps
    /// retrying within its budget. Without a timeout the wait covers every
    /// attempt timing out.
    pub async fn submit_job(
        &self,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<SubmitResponse> {
        let mut job = self.new_job(payload);
        let bound = match timeout {
            Some(timeout) => {
                job = job.with_timeout(timeout);
                timeout
            }
            None => self.config.caller_wait_bound(job.timeout()),
        };
        let handle = self.submit(job).await?;
        Ok(handle.wait(bound).await)
    }

    /// Deliver a worker's result and report what happened to it.
    pub async fn resolve(&self, report: WorkerReport) -> Result<ResolveOutcome> {
        ask(&self.tracker, |reply| TrackerMessage::Resolve {
            report,
            reply: Some(reply),
        })
        .await
    }

    /// Deliver a worker's result without waiting.
    pub fn post_result(&self, report: WorkerReport) -> Result<()> {
        self.tracker
            .send_message(TrackerMessage::Resolve {
                report,
                reply: None,
            })
            .map_err(|e| DispatchError::Actor(e.to_string()))
    }

    /// Expire overdue pending completions now. Returns how many expired.
    pub async fn sweep(&self) -> Result<usize> {
        ask(&self.tracker, |reply| TrackerMessage::Sweep { reply: Some(reply) }).await
    }

    /// Jobs waiting in the queue.
    pub async fn queued(&self) -> Result<usize> {
        ask(&self.queue, |reply| QueueMessage::Len { reply }).await
    }

    /// Jobs dispatched and awaiting a result.
    pub async fn pending(&self) -> Result<usize> {
        ask(&self.tracker, |reply| TrackerMessage::PendingCount { reply }).await
    }

    /// Live dispatcher actors.
    pub async fn dispatchers(&self) -> Result<usize> {
        ask(&self.supervisor, |reply| SupervisorMessage::DispatcherCount { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            outcomes: self.recorder.snapshot(),
            active_jobs: self.registry.total_in_flight(),
            workers: self.registry.workers(),
        }
    }

    /// Stop accepting jobs, fail what is still queued, let in-flight jobs
    /// resolve and stop every actor.
    pub async fn shutdown(&self) -> Result<()> {
        ask(&self.supervisor, |reply| SupervisorMessage::Shutdown { reply }).await?;

        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Supervisor task ended abnormally");
        }
        Ok(())
    }
}
