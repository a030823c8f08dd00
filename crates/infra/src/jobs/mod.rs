//! Job queue model and the workers that drain it.
//!
//! ## Lifecycle
//!
//! - Jobs are inserted `available` (or `scheduled` when they have a future
//!   run time) and claimed with an exclusive lock, becoming `running`
//! - A successful attempt writes the result and marks the job `completed` in
//!   one transaction
//! - A failed attempt becomes `retryable` with exponential backoff, or
//!   `discarded` once `max_attempts` is reached
//! - Attempts stuck in `running` past their deadline are rescued back to
//!   `retryable` by the maintenance task
//!
//! ## Components
//!
//! - `QueuedJob`: a row of the queue with its state and attempt history
//! - `JobRunner`: runs one attempt (generation calls, then the result
//!   transaction)
//! - `WorkerPool`: concurrent claim loops plus rescue/prune maintenance

pub mod executor;
pub mod runner;
pub mod types;

pub use executor::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use runner::{AttemptOutcome, JobRunner, WorkerError};
pub use types::{
    AttemptError, BackoffStrategy, DEFAULT_QUEUE, FailureTransition, InsertParams, JobState,
    QueuedJob, RetryPolicy,
};
