//! Execution of one job attempt.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use dprompts_ai::{GenerationError, GenerationRequest, TextGenerator};
use dprompts_core::{JobArgs, JobId, ResponsePayload};

use crate::error::StoreError;
use crate::store::{GroupResolver, JobQueue, ResultStore};

use super::types::{JobState, QueuedJob};

/// Why an attempt failed. Every variant leaves the job as if the attempt had
/// not run; the retry policy decides what happens next.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("generation call {index} failed: {source}")]
    Generation {
        index: usize,
        #[source]
        source: GenerationError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("attempt exceeded its {0:?} deadline")]
    Timeout(Duration),
}

/// What happened to a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    /// Failed; the job will be retried after its backoff.
    Retrying,
    /// Failed its last allowed attempt.
    Discarded,
    /// Failed, and the claim had already been taken away (rescued or cancelled).
    Lost,
}

/// Runs attempts: generation calls first, then group resolution, result
/// upsert and completion in a single transaction.
pub struct JobRunner<S, G> {
    store: S,
    generator: G,
    attempt_timeout: Duration,
}

impl<S, G> JobRunner<S, G>
where
    S: JobQueue + GroupResolver + ResultStore,
    G: TextGenerator,
{
    pub fn new(store: S, generator: G) -> Self {
        Self {
            store,
            generator,
            attempt_timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn claim(&self, worker: &str) -> Result<Option<QueuedJob>, StoreError> {
        self.store.claim(worker).await
    }

    /// Claim and run one job. `None` when the queue had nothing ready.
    pub async fn process_next(
        &self,
        worker: &str,
    ) -> Result<Option<(JobId, AttemptOutcome)>, StoreError> {
        match self.claim(worker).await? {
            Some(job) => {
                let outcome = self.handle(&job).await?;
                Ok(Some((job.id, outcome)))
            }
            None => Ok(None),
        }
    }

    /// Run a claimed job and report a failure back to the queue.
    pub async fn handle(&self, job: &QueuedJob) -> Result<AttemptOutcome, StoreError> {
        let err = match self.execute(job).await {
            Ok(()) => return Ok(AttemptOutcome::Completed),
            Err(err) => err,
        };

        warn!(
            job_id = %job.id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            error = %err,
            "job attempt failed"
        );

        match self.store.record_failure(job, &err.to_string()).await {
            Ok(JobState::Discarded) => {
                warn!(job_id = %job.id, "job discarded after its final attempt");
                Ok(AttemptOutcome::Discarded)
            }
            Ok(_) => Ok(AttemptOutcome::Retrying),
            Err(StoreError::NotHeld(_)) => {
                debug!(job_id = %job.id, "claim lost before the failure was recorded");
                Ok(AttemptOutcome::Lost)
            }
            Err(err) => Err(err),
        }
    }

    /// One attempt under the attempt deadline.
    ///
    /// A transaction still open when the deadline fires is dropped, which
    /// rolls it back.
    pub async fn execute(&self, job: &QueuedJob) -> Result<(), WorkerError> {
        tokio::time::timeout(self.attempt_timeout, self.run_attempt(job))
            .await
            .unwrap_or(Err(WorkerError::Timeout(self.attempt_timeout)))
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, attempt = job.attempt, calls = job.args.call_count()),
        err
    )]
    async fn run_attempt(&self, job: &QueuedJob) -> Result<(), WorkerError> {
        // External calls happen before the transaction so no locks are held
        // while waiting on the model.
        let responses = self.generate_all(&job.args).await?;
        let payload = ResponsePayload::for_job(&job.args, responses).to_json();

        let mut tx = self.store.begin().await?;
        let group_id = self
            .store
            .resolve_group(&mut tx, job.args.group_name.as_deref())
            .await?;
        self.store
            .upsert_result(&mut tx, job.id, &payload, group_id)
            .await?;
        self.store.complete(&mut tx, job).await?;
        self.store.commit(tx).await?;

        info!(group_id = ?group_id.map(|g| g.get()), "job completed");
        Ok(())
    }

    /// Call the generator once per prompt, strictly in order.
    async fn generate_all(&self, args: &JobArgs) -> Result<Vec<String>, WorkerError> {
        let mut responses = Vec::with_capacity(args.call_count());
        for (index, (prompt, schema)) in args.prompts().into_iter().enumerate() {
            let request = GenerationRequest::new(prompt)
                .with_system(args.base_prompt.clone())
                .with_schema(schema.cloned());

            let generation = self
                .generator
                .generate(&request)
                .await
                .map_err(|source| WorkerError::Generation { index, source })?;

            debug!(index, chars = generation.text.len(), "generation finished");
            responses.push(generation.text);
        }
        Ok(responses)
    }
}
