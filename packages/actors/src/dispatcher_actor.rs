//! Dispatcher actor: pulls jobs off the queue and hands them to workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use dispatch_core::{DispatchConfig, DispatchEvent, JobState, OutcomeStatus};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::messages::{
    DispatcherMessage, JobTicket, PendingCompletion, QueueMessage, TrackerMessage, ask,
};
use crate::registry::WorkerRegistry;
use crate::transport::WorkerTransport;

/// State for a dispatcher actor. Also its spawn arguments, so the
/// supervisor can respawn one from a template.
#[derive(Clone)]
pub struct DispatcherState {
    pub queue: ActorRef<QueueMessage>,
    pub tracker: ActorRef<TrackerMessage>,
    pub registry: Arc<WorkerRegistry>,
    pub transport: Arc<dyn WorkerTransport>,
    pub config: Arc<DispatchConfig>,
    pub event_tx: Option<broadcast::Sender<DispatchEvent>>,
    /// Tickets owned by a dispatcher or a deferral timer: neither queued nor tracked.
    pub held: Arc<AtomicUsize>,
}

impl DispatcherState {
    fn broadcast(&self, event: DispatchEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn release_hold(&self) {
        self.held.fetch_sub(1, Ordering::AcqRel);
    }

    /// Hand one job to the next healthy worker, or hold it back.
    async fn dispatch(&self, mut ticket: JobTicket) {
        let Some(worker_id) = self.registry.select(self.config.selection) else {
            self.defer(ticket);
            return;
        };

        let job = &mut ticket.job;
        job.attempts = job.attempts.saturating_add(1);
        job.transition(JobState::Dispatched {
            worker_id: worker_id.clone(),
            dispatched_at: Utc::now(),
        });
        let job_id = job.id;
        let attempt = job.attempts;
        let envelope = job.envelope();
        let deadline = Instant::now() + job.timeout();

        // Track before delivering so a fast result always finds its entry.
        self.registry.begin_job(&worker_id);
        let pending = PendingCompletion {
            ticket,
            worker_id: worker_id.clone(),
            deadline,
        };
        let tracked = ask(&self.tracker, |reply| TrackerMessage::Track {
            pending: Box::new(pending),
            reply,
        })
        .await;
        self.release_hold();

        if let Err(e) = tracked {
            tracing::error!(job_id = %job_id, error = %e, "Failed to track dispatched job");
            self.registry.end_job(&worker_id);
            return;
        }

        self.broadcast(DispatchEvent::JobDispatched {
            job_id,
            worker_id: worker_id.clone(),
            attempt,
            timestamp: Utc::now(),
        });
        tracing::debug!(job_id = %job_id, worker_id = %worker_id, attempt, "Dispatching job");

        if let Err(e) = self.transport.deliver(&worker_id, envelope).await {
            tracing::warn!(job_id = %job_id, worker_id = %worker_id, error = %e, "Delivery failed");
            let _ = self.tracker.send_message(TrackerMessage::Abandon {
                job_id,
                worker_id,
                attempt,
                error: e.to_string(),
            });
        }
    }

    /// No healthy worker: put the job back after a backoff, unless it has
    /// already waited out its own timeout.
    fn defer(&self, mut ticket: JobTicket) {
        let job_id = ticket.id();

        if ticket.job.expired_since_submit(Utc::now()) {
            tracing::warn!(job_id = %job_id, "No healthy worker before job timeout");
            let _ = self.tracker.send_message(TrackerMessage::Finalize {
                ticket: Box::new(ticket),
                status: OutcomeStatus::TimedOut,
                error: "no healthy worker before timeout".into(),
            });
            self.release_hold();
            return;
        }

        let delay = self.config.backoff(ticket.job.deferrals);
        ticket.job.deferrals = ticket.job.deferrals.saturating_add(1);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        self.broadcast(DispatchEvent::JobDeferred {
            job_id,
            delay_ms,
            timestamp: Utc::now(),
        });
        tracing::debug!(
            job_id = %job_id,
            delay_ms,
            deferrals = ticket.job.deferrals,
            "No healthy worker, holding job"
        );

        let queue = self.queue.clone();
        let tracker = self.tracker.clone();
        let held = self.held.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let requeued = ask(&queue, |reply| QueueMessage::Requeue {
                ticket: Box::new(ticket),
                reply,
            })
            .await;
            match requeued {
                Ok(Ok(())) => {}
                Ok(Err(ticket)) => {
                    let _ = tracker.send_message(TrackerMessage::Finalize {
                        ticket,
                        status: OutcomeStatus::Failed,
                        error: "queue shut down".into(),
                    });
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to requeue held job");
                }
            }
            held.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

/// Dispatcher actor. Several may share one queue.
pub struct DispatcherActor;

impl Actor for DispatcherActor {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatcherState;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "Starting dispatcher");
        myself.send_message(DispatcherMessage::Pull)?;
        Ok(args)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Pull => {
                match ask(&state.queue, |reply| QueueMessage::Next { reply }).await {
                    Ok(Some(ticket)) => {
                        state.held.fetch_add(1, Ordering::AcqRel);
                        state.dispatch(*ticket).await;
                        myself.send_message(DispatcherMessage::Pull)?;
                    }
                    Ok(None) => {
                        tracing::info!(actor_id = %myself.get_id(), "Queue closed, stopping dispatcher");
                        myself.stop(Some("queue closed".into()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Queue unavailable, stopping dispatcher");
                        myself.stop(Some(e.to_string()));
                    }
                }
            }
        }

        Ok(())
    }
}
