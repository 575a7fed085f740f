#![allow(dead_code, clippy::disallowed_methods)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actors::{ChannelTransport, DispatchEngine};
use dispatch_core::{DispatchConfig, DispatchError, JobEnvelope, WorkerId, WorkerReport};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub type Inbox = UnboundedReceiver<JobEnvelope>;

/// Short timeouts so failure paths finish in well under a second.
pub fn fast_config(workers: &[&str]) -> DispatchConfig {
    DispatchConfig {
        per_job_timeout_ms: 300,
        max_retries: 2,
        backoff_base_ms: 10,
        backoff_cap_ms: 40,
        unhealthy_after_failures: 3,
        workers: workers.iter().map(|w| w.to_string()).collect(),
        dispatchers: 1,
        sweep_interval_ms: 20,
        health_check_interval_ms: 50,
        ..Default::default()
    }
}

/// An engine wired to in-process worker inboxes.
pub struct Harness {
    pub engine: DispatchEngine,
    pub transport: Arc<ChannelTransport>,
    inboxes: HashMap<WorkerId, Inbox>,
}

impl Harness {
    pub async fn start(config: DispatchConfig) -> Result<Self, DispatchError> {
        let transport = Arc::new(ChannelTransport::new());
        let inboxes = config
            .workers
            .iter()
            .map(|w| (WorkerId::from(w.as_str()), transport.connect(w.as_str())))
            .collect();
        let engine = DispatchEngine::builder(config)
            .transport(transport.clone())
            .start()
            .await?;
        Ok(Self {
            engine,
            transport,
            inboxes,
        })
    }

    /// Take ownership of a worker's inbox.
    pub fn inbox(&mut self, worker: &str) -> Inbox {
        self.inboxes
            .remove(&WorkerId::from(worker))
            .expect("worker has no inbox")
    }

    /// Answer every job sent to `worker` with an echo of its payload.
    pub fn echo(&mut self, worker: &str) -> JoinHandle<()> {
        let inbox = self.inbox(worker);
        spawn_echo(self.engine.clone(), inbox, Duration::ZERO)
    }
}

/// Worker loop answering each envelope after `delay`.
pub fn spawn_echo(engine: DispatchEngine, mut inbox: Inbox, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = inbox.recv().await {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let report = WorkerReport::success(envelope.job_id, json!({ "echo": envelope.payload }));
            if engine.post_result(report).is_err() {
                break;
            }
        }
    })
}

pub async fn recv_within(inbox: &mut Inbox, ms: u64) -> Option<JobEnvelope> {
    tokio::time::timeout(Duration::from_millis(ms), inbox.recv())
        .await
        .ok()
        .flatten()
}

/// Everything already sitting in the inbox.
pub fn drain(inbox: &mut Inbox) -> Vec<JobEnvelope> {
    let mut envelopes = Vec::new();
    while let Ok(envelope) = inbox.try_recv() {
        envelopes.push(envelope);
    }
    envelopes
}

/// Poll `check` until it holds or `ms` elapses.
pub async fn eventually<F>(ms: u64, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
