//! Core domain types for the job dispatch engine.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobId and the worker wire envelopes
//! - Worker identity and health
//! - Outcome records and the caller-facing response
//! - Events and configuration

mod config;
mod error;
mod events;
mod job;
mod outcome;
mod worker;

pub use config::{DispatchConfig, SelectionPolicy};
pub use error::{ConfigError, DispatchError, Result};
pub use events::DispatchEvent;
pub use job::{Job, JobEnvelope, JobId, JobState, WorkerReport};
pub use outcome::{Completion, OutcomeRecord, OutcomeStatus, SubmitResponse};
pub use worker::{Worker, WorkerHealth, WorkerId};
