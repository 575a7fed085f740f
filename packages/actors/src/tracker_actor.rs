//! Completion tracker: correlates worker results with dispatched jobs.
//!
//! Every terminal outcome passes through [`TrackerState::finalize`], which
//! records it, broadcasts it and consumes the caller's one-shot handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::{
    Completion, DispatchEvent, JobId, JobState, OutcomeRecord, OutcomeStatus, WorkerId,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::messages::{
    JobTicket, PendingCompletion, QueueMessage, ResolveOutcome, TrackerMessage, ask,
};
use crate::recorder::OutcomeRecorder;
use crate::registry::WorkerRegistry;

/// Tracker actor arguments.
pub struct TrackerArgs {
    pub queue: ActorRef<QueueMessage>,
    pub registry: Arc<WorkerRegistry>,
    pub recorder: Arc<OutcomeRecorder>,
    pub sweep_interval: Duration,
    pub event_tx: Option<broadcast::Sender<DispatchEvent>>,
}

/// State for the tracker actor.
pub struct TrackerState {
    /// Dispatched jobs awaiting a result, by job id.
    pending: HashMap<JobId, PendingCompletion>,
    queue: ActorRef<QueueMessage>,
    registry: Arc<WorkerRegistry>,
    recorder: Arc<OutcomeRecorder>,
    event_tx: Option<broadcast::Sender<DispatchEvent>>,
}

impl TrackerState {
    fn broadcast(&self, event: DispatchEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Take a pending completion out of the table and release its worker slot.
    fn take(&mut self, job_id: &JobId) -> Option<PendingCompletion> {
        let pending = self.pending.remove(job_id)?;
        self.registry.end_job(&pending.worker_id);
        Some(pending)
    }

    /// Requeue the job if its budget allows, otherwise finalize it with `terminal`.
    async fn retry_or_finalize(
        &self,
        mut ticket: JobTicket,
        worker_id: Option<WorkerId>,
        reason: String,
        terminal: OutcomeStatus,
    ) -> ResolveOutcome {
        if !ticket.job.can_retry() {
            self.finalize(ticket, terminal, worker_id, Some(reason), None);
            return match terminal {
                OutcomeStatus::Completed => ResolveOutcome::Completed,
                _ => ResolveOutcome::Failed,
            };
        }

        let job_id = ticket.id();
        let attempt = ticket.job.attempts;
        ticket.job.last_error = Some(reason.clone());
        ticket.job.transition(JobState::Retrying {
            attempt,
            reason: reason.clone(),
        });
        self.broadcast(DispatchEvent::JobRetrying {
            job_id,
            attempt,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!(job_id = %job_id, attempt, reason = %reason, "Retrying job");

        let requeued = ask(&self.queue, |reply| QueueMessage::Requeue {
            ticket: Box::new(ticket),
            reply,
        })
        .await;

        match requeued {
            Ok(Ok(())) => ResolveOutcome::Retrying,
            Ok(Err(ticket)) => {
                self.finalize(
                    *ticket,
                    OutcomeStatus::Failed,
                    worker_id,
                    Some("queue shut down".into()),
                    None,
                );
                ResolveOutcome::Failed
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to requeue job");
                ResolveOutcome::Failed
            }
        }
    }

    /// Record, broadcast and notify a terminal outcome.
    fn finalize(
        &self,
        mut ticket: JobTicket,
        status: OutcomeStatus,
        worker_id: Option<WorkerId>,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) {
        let job_id = ticket.id();
        let latency_ms = u64::try_from(ticket.submitted.elapsed().as_millis()).unwrap_or(u64::MAX);

        ticket.job.transition(match status {
            OutcomeStatus::Completed => JobState::Completed,
            OutcomeStatus::Failed => JobState::Failed,
            OutcomeStatus::TimedOut => JobState::TimedOut,
        });
        if error.is_some() {
            ticket.job.last_error.clone_from(&error);
        }

        let record = OutcomeRecord {
            job_id,
            status,
            latency_ms,
            worker_id: worker_id.clone(),
            attempts: ticket.job.attempts,
            error,
            recorded_at: Utc::now(),
        };
        self.recorder.record(record.clone());

        self.broadcast(DispatchEvent::JobResolved {
            job_id,
            status,
            latency_ms,
            worker_id,
            timestamp: record.recorded_at,
        });
        let _ = self.queue.send_message(QueueMessage::Release { job_id });

        tracing::info!(
            job_id = %job_id,
            status = %status,
            latency_ms,
            attempts = record.attempts,
            "Job resolved"
        );

        if !ticket.notify(Completion { record, result }) {
            tracing::debug!(job_id = %job_id, "Caller stopped waiting before resolution");
        }
    }
}

/// Tracker actor owning the pending-completion table.
pub struct TrackerActor;

impl Actor for TrackerActor {
    type Msg = TrackerMessage;
    type State = TrackerState;
    type Arguments = TrackerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            sweep_interval_ms = u64::try_from(args.sweep_interval.as_millis()).unwrap_or(u64::MAX),
            "Starting completion tracker"
        );

        // Start periodic sweep
        let myself_clone = myself.clone();
        let period = args.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if myself_clone
                    .send_message(TrackerMessage::Sweep { reply: None })
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(TrackerState {
            pending: HashMap::new(),
            queue: args.queue,
            registry: args.registry,
            recorder: args.recorder,
            event_tx: args.event_tx,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TrackerMessage::Track { pending, reply } => {
                let job_id = pending.ticket.id();
                if let Some(stale) = state.pending.insert(job_id, *pending) {
                    tracing::warn!(
                        job_id = %job_id,
                        worker_id = %stale.worker_id,
                        "Replaced an existing pending completion"
                    );
                    state.registry.end_job(&stale.worker_id);
                }
                let _ = reply.send(());
            }

            TrackerMessage::Resolve { report, reply } => {
                let job_id = report.job_id;
                let outcome = match state.take(&job_id) {
                    None => {
                        state.recorder.record_late_result();
                        state.broadcast(DispatchEvent::LateResultDiscarded {
                            job_id,
                            timestamp: Utc::now(),
                        });
                        tracing::debug!(job_id = %job_id, "Discarding result for job not pending");
                        ResolveOutcome::Discarded
                    }
                    Some(PendingCompletion {
                        ticket, worker_id, ..
                    }) => {
                        state.registry.record_success(&worker_id);
                        match report.into_result() {
                            Ok(value) => {
                                state.finalize(
                                    ticket,
                                    OutcomeStatus::Completed,
                                    Some(worker_id),
                                    None,
                                    Some(value),
                                );
                                ResolveOutcome::Completed
                            }
                            Err(error) => {
                                tracing::warn!(
                                    job_id = %job_id,
                                    worker_id = %worker_id,
                                    error = %error,
                                    "Worker reported an error"
                                );
                                let reason = format!("worker {} reported: {}", worker_id, error);
                                state
                                    .retry_or_finalize(
                                        ticket,
                                        Some(worker_id),
                                        reason,
                                        OutcomeStatus::Failed,
                                    )
                                    .await
                            }
                        }
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }

            TrackerMessage::Abandon {
                job_id,
                worker_id,
                attempt,
                error,
            } => {
                let current = state
                    .pending
                    .get(&job_id)
                    .is_some_and(|p| p.attempt() == attempt && p.worker_id == worker_id);
                if !current {
                    tracing::debug!(
                        job_id = %job_id,
                        worker_id = %worker_id,
                        attempt,
                        "Delivery failure for an attempt no longer pending"
                    );
                    return Ok(());
                }
                let Some(pending) = state.take(&job_id) else {
                    return Ok(());
                };
                state.registry.record_failure(&worker_id);
                let reason = format!("dispatch to {} failed: {}", worker_id, error);
                state
                    .retry_or_finalize(
                        pending.ticket,
                        Some(worker_id),
                        reason,
                        OutcomeStatus::Failed,
                    )
                    .await;
            }

            TrackerMessage::Finalize {
                ticket,
                status,
                error,
            } => {
                state.finalize(*ticket, status, None, Some(error), None);
            }

            TrackerMessage::Sweep { reply } => {
                let now = Instant::now();
                let expired: Vec<JobId> = state
                    .pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();

                for job_id in &expired {
                    let Some(pending) = state.take(job_id) else {
                        continue;
                    };
                    let PendingCompletion {
                        ticket, worker_id, ..
                    } = pending;
                    state.registry.record_failure(&worker_id);
                    tracing::warn!(
                        job_id = %job_id,
                        worker_id = %worker_id,
                        attempt = ticket.job.attempts,
                        timeout_ms = ticket.job.timeout_ms,
                        "No result before deadline"
                    );
                    let reason = format!(
                        "no result from {} within {}ms",
                        worker_id, ticket.job.timeout_ms
                    );
                    state
                        .retry_or_finalize(
                            ticket,
                            Some(worker_id),
                            reason,
                            OutcomeStatus::TimedOut,
                        )
                        .await;
                }

                if let Some(reply) = reply {
                    let _ = reply.send(expired.len());
                }
            }

            TrackerMessage::PendingCount { reply } => {
                let _ = reply.send(state.pending.len());
            }

            TrackerMessage::Shutdown { reply } => {
                let ids: Vec<JobId> = state.pending.keys().copied().collect();
                for job_id in &ids {
                    if let Some(pending) = state.take(job_id) {
                        state.finalize(
                            pending.ticket,
                            OutcomeStatus::Failed,
                            Some(pending.worker_id),
                            Some("engine shut down".into()),
                            None,
                        );
                    }
                }
                tracing::info!(failed = ids.len(), "Shutting down completion tracker");
                let _ = reply.send(ids.len());
                myself.stop(None);
            }
        }

        Ok(())
    }
}
