//! Queue actor holding jobs waiting for a dispatcher.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use dispatch_core::{DispatchError, DispatchEvent, JobId};
use ractor::{Actor, ActorProcessingErr, ActorRef, MessagingErr, RpcReplyPort};
use tokio::sync::broadcast;

use crate::messages::{JobTicket, QueueMessage};

type Waiter = RpcReplyPort<Option<Box<JobTicket>>>;

/// State for the queue actor.
pub struct QueueActorState {
    /// Jobs in arrival order.
    jobs: VecDeque<JobTicket>,
    /// Dispatchers parked on `Next`, oldest first.
    waiters: VecDeque<Waiter>,
    /// Ids of every job admitted and not yet finalized.
    admitted: HashSet<JobId>,
    /// Bound on queued jobs for new submissions.
    capacity: Option<usize>,
    closed: bool,
    event_tx: Option<broadcast::Sender<DispatchEvent>>,
}

impl QueueActorState {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            jobs: VecDeque::new(),
            waiters: VecDeque::new(),
            admitted: HashSet::new(),
            capacity,
            closed: false,
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<DispatchEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.jobs.len() >= cap)
    }

    /// Hand the ticket to the oldest live waiter, or append it to the tail.
    fn push(&mut self, ticket: JobTicket) {
        let mut ticket = Box::new(ticket);
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Some(ticket)) {
                Ok(()) => return,
                // The waiter went away; try the next one.
                Err(MessagingErr::SendErr(Some(returned))) => ticket = returned,
                Err(_) => {
                    tracing::error!("Lost a job handing it to a dispatcher");
                    return;
                }
            }
        }
        self.jobs.push_back(*ticket);
    }
}

/// Queue actor: FIFO of job tickets with blocking `Next`.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(capacity = ?args.capacity, "Starting queue actor");
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Submit { ticket, reply } => {
                let job_id = ticket.id();
                if state.closed {
                    let _ = reply.send(Err(DispatchError::QueueClosed));
                    return Ok(());
                }

                if state.admitted.contains(&job_id) {
                    let _ = reply.send(Err(DispatchError::DuplicateJob(job_id)));
                    return Ok(());
                }

                if state.is_full() {
                    let capacity = state.capacity.unwrap_or_default();
                    tracing::warn!(job_id = %job_id, capacity, "Queue full, rejecting job");
                    let _ = reply.send(Err(DispatchError::QueueFull { capacity }));
                    return Ok(());
                }

                state.admitted.insert(job_id);
                if let Some(ref tx) = state.event_tx {
                    let _ = tx.send(DispatchEvent::JobSubmitted {
                        job_id,
                        timestamp: Utc::now(),
                    });
                }
                state.push(*ticket);
                tracing::debug!(job_id = %job_id, queued = state.jobs.len(), "Job submitted");

                let _ = reply.send(Ok(()));
            }

            QueueMessage::Requeue { ticket, reply } => {
                if state.closed {
                    let _ = reply.send(Err(ticket));
                    return Ok(());
                }

                // Requeued jobs were already admitted, so capacity does not apply.
                let job_id = ticket.id();
                state.push(*ticket);
                tracing::debug!(job_id = %job_id, "Job requeued");

                let _ = reply.send(Ok(()));
            }

            QueueMessage::Next { reply } => {
                if state.closed {
                    let _ = reply.send(None);
                    return Ok(());
                }

                match state.jobs.pop_front() {
                    Some(ticket) => {
                        if let Err(MessagingErr::SendErr(Some(ticket))) =
                            reply.send(Some(Box::new(ticket)))
                        {
                            // The dispatcher is gone; keep the job at the head.
                            state.jobs.push_front(*ticket);
                        }
                    }
                    None => state.waiters.push_back(reply),
                }
            }

            QueueMessage::Release { job_id } => {
                state.admitted.remove(&job_id);
            }

            QueueMessage::Len { reply } => {
                let _ = reply.send(state.jobs.len());
            }

            QueueMessage::Shutdown { reply } => {
                state.closed = true;
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(None);
                }
                let drained: Vec<JobTicket> = state.jobs.drain(..).collect();
                tracing::info!(drained = drained.len(), "Queue closed");
                let _ = reply.send(drained);
            }
        }

        Ok(())
    }
}
