//! Message types for actor communication.

use dispatch_core::{
    Completion, DispatchError, Job, JobId, OutcomeStatus, WorkerId, WorkerReport,
};
use ractor::{ActorRef, Message, RpcReplyPort};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A job plus the one-shot handle its caller is waiting on.
///
/// The handle is consumed by [`JobTicket::notify`], so a ticket can reach a
/// terminal outcome at most once.
#[derive(Debug)]
pub struct JobTicket {
    pub job: Job,
    /// Monotonic submission time, for latency accounting.
    pub submitted: Instant,
    notifier: oneshot::Sender<Completion>,
}

impl JobTicket {
    /// Wrap a job and return the receiving half for the caller.
    pub fn new(job: Job) -> (Self, oneshot::Receiver<Completion>) {
        let (notifier, rx) = oneshot::channel();
        let ticket = Self {
            job,
            submitted: Instant::now(),
            notifier,
        };
        (ticket, rx)
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// Deliver the terminal outcome. Returns false if the caller stopped waiting.
    pub fn notify(self, completion: Completion) -> bool {
        self.notifier.send(completion).is_ok()
    }
}

/// Bookkeeping for a dispatched job awaiting its worker's result.
#[derive(Debug)]
pub struct PendingCompletion {
    pub ticket: JobTicket,
    pub worker_id: WorkerId,
    pub deadline: Instant,
}

impl PendingCompletion {
    /// Dispatch attempt this record belongs to.
    pub fn attempt(&self) -> u32 {
        self.ticket.job.attempts
    }
}

/// What `resolve` did with a worker report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The job completed and the caller was notified.
    Completed,
    /// The worker reported an error and the job went back to the queue.
    Retrying,
    /// The worker reported an error on the final attempt.
    Failed,
    /// No pending completion: the result was late or a duplicate.
    Discarded,
}

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Admit a new job.
    Submit {
        ticket: Box<JobTicket>,
        reply: RpcReplyPort<Result<(), DispatchError>>,
    },

    /// Put a retried or deferred job back at the tail. A closed queue hands
    /// the ticket back so it can be finalized.
    Requeue {
        ticket: Box<JobTicket>,
        reply: RpcReplyPort<Result<(), Box<JobTicket>>>,
    },

    /// Wait for the next job; `None` once the queue is shut down.
    Next {
        reply: RpcReplyPort<Option<Box<JobTicket>>>,
    },

    /// Forget a finalized job id so it may be submitted again.
    Release { job_id: JobId },

    /// Number of queued jobs.
    Len { reply: RpcReplyPort<usize> },

    /// Stop accepting jobs, wake every waiter with `None` and hand back what
    /// was still queued.
    Shutdown { reply: RpcReplyPort<Vec<JobTicket>> },
}

/// Messages for the DispatcherActor.
#[derive(Debug)]
pub enum DispatcherMessage {
    /// Pull the next job from the queue and hand it off.
    Pull,
}

/// Messages for the TrackerActor.
#[derive(Debug)]
pub enum TrackerMessage {
    /// Register a pending completion before the job is delivered.
    Track {
        pending: Box<PendingCompletion>,
        reply: RpcReplyPort<()>,
    },

    /// A worker posted a result.
    Resolve {
        report: WorkerReport,
        reply: Option<RpcReplyPort<ResolveOutcome>>,
    },

    /// Delivery to the worker failed. Only applies while `attempt` on
    /// `worker_id` is still the job's pending attempt.
    Abandon {
        job_id: JobId,
        worker_id: WorkerId,
        attempt: u32,
        error: String,
    },

    /// Finalize a job that never reached a worker.
    Finalize {
        ticket: Box<JobTicket>,
        status: OutcomeStatus,
        error: String,
    },

    /// Expire pending completions past their deadline.
    Sweep { reply: Option<RpcReplyPort<usize>> },

    /// Number of pending completions.
    PendingCount { reply: RpcReplyPort<usize> },

    /// Fail whatever is still pending and stop.
    Shutdown { reply: RpcReplyPort<usize> },
}

/// References to the engine's singleton actors.
#[derive(Debug, Clone)]
pub struct EngineActors {
    pub queue: ActorRef<QueueMessage>,
    pub tracker: ActorRef<TrackerMessage>,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// The queue and tracker spawned by the supervisor.
    Actors { reply: RpcReplyPort<EngineActors> },

    /// Number of live dispatcher actors.
    DispatcherCount { reply: RpcReplyPort<usize> },

    /// Drain and stop the engine.
    Shutdown { reply: RpcReplyPort<()> },
}

/// Request/response against an actor, mapping messaging failures to [`DispatchError`].
pub(crate) async fn ask<TMsg, TReply, F>(
    actor: &ActorRef<TMsg>,
    build: F,
) -> Result<TReply, DispatchError>
where
    TMsg: Message,
    TReply: Send + 'static,
    F: FnOnce(RpcReplyPort<TReply>) -> TMsg,
{
    match ractor::rpc::call(actor, build, None).await {
        Ok(ractor::rpc::CallResult::Success(value)) => Ok(value),
        Ok(ractor::rpc::CallResult::Timeout) => Err(DispatchError::Actor("call timed out".into())),
        Ok(ractor::rpc::CallResult::SenderError) => {
            Err(DispatchError::Actor("actor dropped the reply".into()))
        }
        Err(e) => Err(DispatchError::Actor(e.to_string())),
    }
}
