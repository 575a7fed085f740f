//! Runs the dispatch engine against in-process demo replicas and prints the
//! outcome snapshot.

mod replicas;

use std::sync::Arc;

use actors::{ChannelTransport, DispatchEngine};
use dispatch_core::{DispatchConfig, OutcomeStatus};
use futures_util::future::join_all;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::replicas::Behaviour;

/// Jobs submitted by the demo run.
const DEMO_JOBS: usize = 12;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DispatchConfig::from_env()?;
    tracing::info!(
        workers = ?config.workers,
        per_job_timeout_ms = config.per_job_timeout_ms,
        max_retries = config.max_retries,
        selection = ?config.selection,
        "Starting dispatch engine"
    );

    let transport = Arc::new(ChannelTransport::new());
    let inboxes: Vec<_> = config
        .workers
        .iter()
        .map(|name| (name.clone(), transport.connect(name.as_str())))
        .collect();

    let engine = DispatchEngine::builder(config)
        .transport(transport.clone())
        .start()
        .await?;

    for (index, (name, inbox)) in inboxes.into_iter().enumerate() {
        replicas::spawn(name, Behaviour::for_index(index), engine.clone(), inbox);
    }

    // Every fourth job asks flaky replicas to fail.
    let submissions = (0..DEMO_JOBS).map(|i| {
        let engine = engine.clone();
        async move {
            let payload = json!({ "seq": i, "fail": i % 4 == 3 });
            engine.submit_job(payload, None).await
        }
    });

    for response in join_all(submissions).await {
        match response {
            Ok(response) => tracing::info!(
                job_id = %response.job_id,
                status = %response.status,
                latency_ms = response.latency_ms,
                worker = ?response.worker_id,
                "Job finished"
            ),
            Err(e) => tracing::warn!(error = %e, "Submission rejected"),
        }
    }

    let snapshot = engine.snapshot();
    tracing::info!(
        completed = snapshot.outcomes.count(OutcomeStatus::Completed),
        failed = snapshot.outcomes.count(OutcomeStatus::Failed),
        timed_out = snapshot.outcomes.count(OutcomeStatus::TimedOut),
        late_results = snapshot.outcomes.late_results,
        "Demo run complete"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    engine.shutdown().await?;
    Ok(())
}
