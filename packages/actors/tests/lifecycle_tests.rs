#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actors::{ChannelTransport, DeliveryResult, DispatchEngine, FnProbe, FnTransport};
use common::{Harness, eventually, fast_config, recv_within, spawn_echo};
use dispatch_core::{
    DispatchError, JobEnvelope, OutcomeStatus, WorkerHealth, WorkerId, WorkerReport,
};
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_shutdown_fails_queued_and_held_jobs() -> Result<(), Box<dyn Error>> {
    let mut config = fast_config(&["w1"]);
    config.per_job_timeout_ms = 5_000;
    let harness = Harness::start(config).await?;
    harness.engine.registry().mark_unhealthy(&WorkerId::from("w1"))?;

    let mut handles = Vec::new();
    for i in 0..3 {
        let job = harness.engine.new_job(json!(i));
        handles.push(harness.engine.submit(job).await?);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.engine.shutdown().await?;

    for handle in handles {
        let completion = handle.completion().await?;
        assert_eq!(completion.record.status, OutcomeStatus::Failed);
        assert_eq!(completion.record.error.as_deref(), Some("queue shut down"));
        assert_eq!(completion.record.attempts, 0);
    }
    assert_eq!(harness.engine.recorder().count(OutcomeStatus::Failed), 3);

    let after = harness.engine.submit(harness.engine.new_job(json!({}))).await;
    assert!(after.is_err());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_jobs_resolve() -> Result<(), Box<dyn Error>> {
    let mut harness = Harness::start(fast_config(&["w1"])).await?;
    let inbox = harness.inbox("w1");
    spawn_echo(harness.engine.clone(), inbox, Duration::from_millis(100));

    let handle = harness.engine.submit(harness.engine.new_job(json!("slow"))).await?;
    let engine = harness.engine.clone();
    assert!(
        eventually(1_000, || engine.snapshot().active_jobs == 1).await,
        "job never dispatched"
    );

    harness.engine.shutdown().await?;

    let completion = handle.completion().await?;
    assert_eq!(completion.record.status, OutcomeStatus::Completed);
    assert_eq!(completion.result, Some(json!({"echo": "slow"})));
    Ok(())
}

#[tokio::test]
async fn test_health_probe_drives_dispatch() -> Result<(), Box<dyn Error>> {
    let w2_up = Arc::new(AtomicBool::new(false));
    let probe_flag = w2_up.clone();
    let probe = FnProbe::new(move |id: &WorkerId| {
        let ok = id.as_str() != "w2" || probe_flag.load(Ordering::SeqCst);
        Box::pin(async move { ok })
    });

    let transport = Arc::new(ChannelTransport::new());
    let mut w1 = transport.connect("w1");
    let mut w2 = transport.connect("w2");
    let engine = DispatchEngine::builder(fast_config(&["w1", "w2"]))
        .transport(transport.clone())
        .probe(Arc::new(probe))
        .start()
        .await?;

    let registry = engine.registry().clone();
    assert!(
        eventually(1_000, || registry.list_healthy() == vec![WorkerId::from("w1")]).await,
        "first probe did not settle health"
    );
    assert_eq!(
        registry.get(&WorkerId::from("w2")).ok_or("w2 missing")?.health,
        WorkerHealth::Unhealthy
    );

    let mut delivered = Vec::new();
    for i in 0..2 {
        engine.submit(engine.new_job(json!(i))).await?;
        delivered.push(recv_within(&mut w1, 1_000).await.ok_or("job not on w1")?);
    }

    w2_up.store(true, Ordering::SeqCst);
    assert!(
        eventually(1_000, || registry.list_healthy().len() == 2).await,
        "w2 never recovered"
    );

    // Both healthy: two consecutive jobs go to different workers.
    for i in 0..2 {
        engine.submit(engine.new_job(json!(i))).await?;
    }
    delivered.push(recv_within(&mut w2, 1_000).await.ok_or("recovered w2 unused")?);
    delivered.push(recv_within(&mut w1, 1_000).await.ok_or("rotation stalled")?);

    for envelope in delivered {
        engine
            .resolve(WorkerReport::success(envelope.job_id, json!(null)))
            .await?;
    }
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_queue_full_surfaces_to_submitter() -> Result<(), Box<dyn Error>> {
    // A slow transport keeps the single dispatcher busy so the queue fills.
    let (tx, mut delivered) = mpsc::unbounded_channel::<JobEnvelope>();
    let transport = FnTransport::new(move |_worker: &WorkerId, envelope: JobEnvelope| {
        let tx = tx.clone();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(envelope);
            let result: DeliveryResult = Ok(());
            result
        })
    });

    let mut config = fast_config(&["w1"]);
    config.max_queue_size = Some(1);
    config.per_job_timeout_ms = 5_000;
    let engine = DispatchEngine::builder(config)
        .transport(Arc::new(transport))
        .start()
        .await?;

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..4 {
        match engine.submit(engine.new_job(json!(i))).await {
            Ok(_) => accepted += 1,
            Err(DispatchError::QueueFull { capacity }) => {
                assert_eq!(capacity, 1);
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    assert!(rejected >= 1, "accepted {accepted}, rejected {rejected}");
    assert!(engine.queued().await? <= 1);

    for _ in 0..accepted {
        let envelope = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
            .await?
            .ok_or("accepted job lost")?;
        engine
            .resolve(WorkerReport::success(envelope.job_id, json!(null)))
            .await?;
    }
    assert_eq!(engine.recorder().count(OutcomeStatus::Completed), accepted);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_start_rejects_invalid_setup() -> Result<(), Box<dyn Error>> {
    let mut config = fast_config(&["w1"]);
    config.dispatchers = 0;
    let result = DispatchEngine::builder(config)
        .transport(Arc::new(ChannelTransport::new()))
        .start()
        .await;
    assert!(matches!(result, Err(DispatchError::Config(_))));

    let result = DispatchEngine::builder(fast_config(&["w1"])).start().await;
    assert!(matches!(result, Err(DispatchError::Config(_))));

    let mut config = fast_config(&["w1"]);
    config.dispatchers = 3;
    let harness = Harness::start(config).await?;
    assert_eq!(harness.engine.dispatchers().await?, 3);
    assert_eq!(harness.engine.registry().len(), 1);
    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_dispatchers_share_queue_and_counts() -> Result<(), Box<dyn Error>> {
    let mut config = fast_config(&["w1", "w2", "w3"]);
    config.dispatchers = 3;
    config.per_job_timeout_ms = 5_000;
    let mut harness = Harness::start(config).await?;
    for worker in ["w1", "w2", "w3"] {
        harness.echo(worker);
    }
    assert_eq!(harness.engine.dispatchers().await?, 3);

    let engine = harness.engine.clone();
    let responses = join_all((0..30).map(|i| {
        let engine = engine.clone();
        async move { engine.submit_job(json!({ "n": i }), None).await }
    }))
    .await;

    let mut per_worker: HashMap<String, usize> = HashMap::new();
    for response in responses {
        let response = response?;
        assert_eq!(response.status, OutcomeStatus::Completed);
        let worker = response.worker_id.ok_or("completed without a worker")?;
        *per_worker.entry(worker.to_string()).or_default() += 1;
    }
    // One shared cursor: every worker gets an equal share.
    assert_eq!(per_worker.len(), 3);
    assert!(per_worker.values().all(|&n| n == 10), "{per_worker:?}");

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.active_jobs, 0);
    assert!(snapshot.workers.iter().all(|w| w.in_flight == 0));
    assert_eq!(snapshot.outcomes.count(OutcomeStatus::Completed), 30);
    assert_eq!(engine.pending().await?, 0);
    assert_eq!(engine.queued().await?, 0);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_panicking_dispatcher_is_respawned() -> Result<(), Box<dyn Error>> {
    // The first delivery panics inside the dispatcher; later ones succeed.
    let tripped = Arc::new(AtomicBool::new(false));
    let (tx, mut delivered) = mpsc::unbounded_channel::<JobEnvelope>();
    let transport = FnTransport::new(move |_worker: &WorkerId, envelope: JobEnvelope| {
        let first = !tripped.swap(true, Ordering::SeqCst);
        let tx = tx.clone();
        Box::pin(async move {
            if first {
                panic!("transport blew up");
            }
            let _ = tx.send(envelope);
            let result: DeliveryResult = Ok(());
            result
        })
    });

    let engine = DispatchEngine::builder(fast_config(&["w1"]))
        .transport(Arc::new(transport))
        .start()
        .await?;
    assert_eq!(engine.dispatchers().await?, 1);

    let handle = engine.submit(engine.new_job(json!("again"))).await?;

    // The lost attempt expires and the replacement dispatcher picks it up.
    let envelope = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
        .await?
        .ok_or("job never redelivered")?;
    assert_eq!(envelope.job_id, handle.job_id);
    assert_eq!(engine.dispatchers().await?, 1);

    engine
        .resolve(WorkerReport::success(envelope.job_id, json!("done")))
        .await?;
    let completion = handle.completion().await?;
    assert_eq!(completion.record.status, OutcomeStatus::Completed);
    assert_eq!(completion.record.attempts, 2);
    assert_eq!(engine.snapshot().active_jobs, 0);

    engine.shutdown().await?;
    Ok(())
}
