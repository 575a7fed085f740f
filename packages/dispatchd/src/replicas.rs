//! In-process demo replicas answering jobs over a channel transport.

use std::time::Duration;

use actors::DispatchEngine;
use dispatch_core::{JobEnvelope, WorkerReport};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// How a demo replica answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Answer immediately with the payload.
    Echo,
    /// Answer after a delay.
    Slow(Duration),
    /// Report an error for payloads with `"fail": true`.
    Flaky,
}

impl Behaviour {
    /// Cycle echo, slow, flaky across the pool.
    pub fn for_index(index: usize) -> Self {
        match index % 3 {
            0 => Behaviour::Echo,
            1 => Behaviour::Slow(Duration::from_millis(250)),
            _ => Behaviour::Flaky,
        }
    }

    async fn answer(self, name: &str, envelope: JobEnvelope) -> WorkerReport {
        match self {
            Behaviour::Echo => WorkerReport::success(
                envelope.job_id,
                json!({ "replica": name, "echo": envelope.payload }),
            ),
            Behaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                WorkerReport::success(
                    envelope.job_id,
                    json!({ "replica": name, "echo": envelope.payload, "delayMs": delay.as_millis() as u64 }),
                )
            }
            Behaviour::Flaky => {
                let fail = envelope
                    .payload
                    .get("fail")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if fail {
                    WorkerReport::failure(envelope.job_id, format!("{} refused the job", name))
                } else {
                    WorkerReport::success(envelope.job_id, json!({ "replica": name }))
                }
            }
        }
    }
}

/// Serve jobs from `inbox` until the transport drops it.
pub fn spawn(
    name: String,
    behaviour: Behaviour,
    engine: DispatchEngine,
    mut inbox: UnboundedReceiver<JobEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(replica = %name, ?behaviour, "Replica ready");
        while let Some(envelope) = inbox.recv().await {
            let engine = engine.clone();
            let name = name.clone();
            // Each job runs on its own task so a slow answer does not block the inbox.
            tokio::spawn(async move {
                let report = behaviour.answer(&name, envelope).await;
                if let Err(e) = engine.post_result(report) {
                    tracing::warn!(replica = %name, error = %e, "Failed to post result");
                }
            });
        }
    })
}
