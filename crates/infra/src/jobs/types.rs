//! Queue job types and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use dprompts_core::{JobArgs, JobId, JOB_KIND};

/// Queue name used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Job state as recorded by the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed
    Available,
    /// Waiting for `scheduled_at`
    Scheduled,
    /// Claimed by a worker
    Running,
    /// Failed an attempt, waiting for its backoff to expire
    Retryable,
    /// Finished successfully; a result row exists
    Completed,
    /// Cancelled by an operator
    Cancelled,
    /// Exhausted its attempts
    Discarded,
}

impl JobState {
    /// States in which a job is still waiting for a worker.
    pub const QUEUED: [JobState; 3] = [JobState::Available, JobState::Scheduled, JobState::Retryable];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Discarded => "discarded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Discarded
        )
    }

    pub fn is_queued(&self) -> bool {
        Self::QUEUED.contains(self)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobState::Available),
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            "retryable" => Ok(JobState::Retryable),
            "completed" => Ok(JobState::Completed),
            "cancelled" => Ok(JobState::Cancelled),
            "discarded" => Ok(JobState::Discarded),
            other => Err(format!("invalid job state: {other}")),
        }
    }
}

/// How the retry delay grows with the attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` every time
    Constant,
    /// `base_delay * 2^(attempt-1)`
    #[default]
    Doubling,
}

/// When a failed job runs again, and how often it may fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts a job gets unless it was inserted with its own limit
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of any delay, jitter included
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Relative spread applied around the delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Doubling,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Same delay after every failure, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Constant,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    ///
    /// The jitter is derived from `seed` (the job id) and the attempt, so jobs
    /// that failed together spread out while any one job's schedule stays
    /// reproducible.
    pub fn retry_delay(&self, attempt: u32, seed: i64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Constant => self.base_delay,
            BackoffStrategy::Doubling => self
                .base_delay
                .saturating_mul(1u32 << (attempt - 1).min(31)),
        }
        .min(self.max_delay);

        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + self.jitter * (spread(seed, attempt) * 2.0 - 1.0);
        delay.mul_f64(factor.max(0.0)).min(self.max_delay)
    }
}

/// Uniform-looking value in `[0, 1)` from a seed and an attempt number.
fn spread(seed: i64, attempt: u32) -> f64 {
    let mut x = (seed as u64) ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x >> 11) as f64 / (1u64 << 53) as f64
}

/// Parameters of one job insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertParams {
    pub args: JobArgs,
    /// Free-form metadata, passed through unmodified.
    pub metadata: Option<JsonValue>,
    pub queue: String,
    /// Overrides the queue's default attempt limit.
    pub max_attempts: Option<u32>,
    /// Delay the first attempt until this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl InsertParams {
    pub fn new(args: JobArgs) -> Self {
        Self {
            args,
            metadata: None,
            queue: DEFAULT_QUEUE.to_string(),
            max_attempts: None,
            scheduled_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<JsonValue>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// State the row starts in.
    pub fn initial_state(&self, now: DateTime<Utc>) -> JobState {
        match self.scheduled_at {
            Some(at) if at > now => JobState::Scheduled,
            _ => JobState::Available,
        }
    }
}

/// Error recorded for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: String,
}

/// A job row as seen by workers and operators.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: JobId,
    pub kind: String,
    pub queue: String,
    pub args: JobArgs,
    pub metadata: Option<JsonValue>,
    pub state: JobState,
    /// Attempts started so far (incremented on claim).
    pub attempt: u32,
    pub max_attempts: u32,
    pub errors: Vec<AttemptError>,
    pub attempted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Where a failed attempt sends the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTransition {
    pub state: JobState,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    /// Build the row an insert produces.
    pub fn from_insert(id: JobId, params: InsertParams, policy: &RetryPolicy, now: DateTime<Utc>) -> Self {
        let state = params.initial_state(now);
        Self {
            id,
            kind: JOB_KIND.to_string(),
            queue: params.queue,
            args: params.args,
            metadata: params.metadata,
            state,
            attempt: 0,
            max_attempts: params.max_attempts.unwrap_or(policy.max_attempts),
            errors: Vec::new(),
            attempted_by: None,
            created_at: now,
            scheduled_at: params.scheduled_at.unwrap_or(now),
            attempted_at: None,
            finalized_at: None,
        }
    }

    /// Whether a worker may claim the job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state.is_queued() && self.scheduled_at <= now
    }

    pub fn mark_running(&mut self, worker: &str, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.attempt += 1;
        self.attempted_at = Some(now);
        self.attempted_by = Some(worker.to_string());
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.finalized_at = Some(now);
    }

    /// Decide the next state after the current attempt failed.
    pub fn failure_transition(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> FailureTransition {
        if self.attempt < self.max_attempts {
            let delay = policy.retry_delay(self.attempt, self.id.get());
            FailureTransition {
                state: JobState::Retryable,
                scheduled_at: Some(now + chrono::Duration::from_std(delay).unwrap_or_default()),
                finalized_at: None,
            }
        } else {
            FailureTransition {
                state: JobState::Discarded,
                scheduled_at: None,
                finalized_at: Some(now),
            }
        }
    }

    pub fn apply_failure(&mut self, transition: FailureTransition, error: &str, now: DateTime<Utc>) {
        self.errors.push(AttemptError {
            attempt: self.attempt,
            at: now,
            error: error.to_string(),
        });
        self.state = transition.state;
        if let Some(at) = transition.scheduled_at {
            self.scheduled_at = at;
        }
        self.finalized_at = transition.finalized_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dprompts_core::{JobSpec, SchemaRegistry};

    fn args() -> JobArgs {
        JobSpec::single("hi").into_args(&SchemaRegistry::empty()).unwrap().0
    }

    #[test]
    fn doubling_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Doubling,
            jitter: 0.0,
        };

        let delays: Vec<_> = (1..=4).map(|a| policy.retry_delay(a, 9)).collect();
        assert_eq!(
            delays,
            [250, 500, 1000, 2000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.retry_delay(40, 9), Duration::from_secs(5));
        assert_eq!(policy.retry_delay(0, 9), Duration::ZERO);
    }

    #[test]
    fn fixed_policy_ignores_attempt_and_seed() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));
        assert_eq!(policy.retry_delay(1, 1), Duration::from_secs(2));
        assert_eq!(policy.retry_delay(3, 77), Duration::from_secs(2));
    }

    #[test]
    fn jitter_is_bounded_and_reproducible() {
        let policy = RetryPolicy::default();
        let low = Duration::from_millis(3600);
        let high = Duration::from_millis(4400);

        let delays: Vec<_> = (1..=50).map(|job| policy.retry_delay(3, job)).collect();
        assert!(delays.iter().all(|d| *d >= low && *d <= high), "{delays:?}");
        assert!(delays.iter().any(|d| *d != delays[0]));
        assert_eq!(policy.retry_delay(3, 17), policy.retry_delay(3, 17));
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in [
            JobState::Available,
            JobState::Scheduled,
            JobState::Running,
            JobState::Retryable,
            JobState::Completed,
            JobState::Cancelled,
            JobState::Discarded,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("done".parse::<JobState>().is_err());
    }

    #[test]
    fn future_schedule_starts_scheduled() {
        let now = Utc::now();
        let params = InsertParams::new(args()).scheduled_at(now + chrono::Duration::minutes(5));
        let job = QueuedJob::from_insert(JobId::new(1), params, &RetryPolicy::default(), now);

        assert_eq!(job.state, JobState::Scheduled);
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::minutes(6)));
    }

    #[test]
    fn failure_retries_then_discards() {
        let now = Utc::now();
        let policy = RetryPolicy::fixed(2, Duration::from_secs(1));
        let mut job =
            QueuedJob::from_insert(JobId::new(1), InsertParams::new(args()), &policy, now);
        assert_eq!(job.max_attempts, 2);

        job.mark_running("w1", now);
        let t = job.failure_transition(&policy, now);
        job.apply_failure(t, "boom", now);
        assert_eq!(job.state, JobState::Retryable);
        assert_eq!(job.scheduled_at, now + chrono::Duration::seconds(1));

        job.mark_running("w1", now);
        let t = job.failure_transition(&policy, now);
        job.apply_failure(t, "boom again", now);
        assert_eq!(job.state, JobState::Discarded);
        assert_eq!(job.finalized_at, Some(now));
        assert_eq!(job.errors.len(), 2);
        assert_eq!(job.errors[1].attempt, 2);
    }

    #[test]
    fn insert_limit_overrides_policy() {
        let params = InsertParams::new(args()).with_max_attempts(3);
        let job = QueuedJob::from_insert(JobId::new(1), params, &RetryPolicy::default(), Utc::now());
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.kind, JOB_KIND);
    }
}
