//! Actor system for the job dispatch engine.
//!
//! This crate provides the Ractor-based engine that queues jobs, hands them
//! to a pool of interchangeable workers and tracks each one to a single
//! terminal outcome.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor owning the others; respawns dispatchers
//! - `QueueActor` - FIFO of submitted jobs; parks idle dispatchers
//! - `DispatcherActor` - Pulls jobs and delivers them to the next healthy worker
//! - `TrackerActor` - Correlates worker results, expires overdue jobs, retries
//! - `WorkerRegistry` - Pool membership, health and in-flight load
//! - `OutcomeRecorder` - Counts and latency histograms per terminal status
//!
//! # Usage
//!
//! ```ignore
//! use actors::{ChannelTransport, DispatchEngine};
//!
//! let transport = Arc::new(ChannelTransport::new());
//! let mut inbox = transport.connect("replica-1");
//! let engine = DispatchEngine::builder(config)
//!     .transport(transport)
//!     .start()
//!     .await?;
//!
//! let response = engine.submit_job(json!({"text": "hi"}), None).await?;
//! ```

mod dispatcher_actor;
mod engine;
pub mod health;
mod messages;
mod queue_actor;
pub mod recorder;
pub mod registry;
mod supervisor;
mod tracker_actor;
pub mod transport;

pub use dispatcher_actor::{DispatcherActor, DispatcherState};
pub use engine::{DispatchEngine, EngineBuilder, EngineSnapshot, JobHandle};
pub use health::{FnProbe, HealthMonitor, HealthProbe, ProbeFuture};
pub use messages::{
    DispatcherMessage, EngineActors, JobTicket, PendingCompletion, QueueMessage, ResolveOutcome,
    SupervisorMessage, TrackerMessage,
};
pub use queue_actor::{QueueActor, QueueActorState};
pub use recorder::{BucketCount, OutcomeRecorder, RecorderSnapshot, StatusSummary};
pub use registry::WorkerRegistry;
pub use supervisor::{Supervisor, SupervisorArgs, start_supervisor};
pub use tracker_actor::{TrackerActor, TrackerArgs};
pub use transport::{
    ChannelTransport, DeliveryFuture, DeliveryResult, FnTransport, TransportError,
    WorkerTransport,
};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
