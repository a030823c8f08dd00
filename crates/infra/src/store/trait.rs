use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use dprompts_core::{GroupId, JobId};

use crate::error::StoreResult;
use crate::jobs::{InsertParams, JobState, QueuedJob};

/// Transaction boundary shared by every write path.
///
/// A `Tx` that is dropped without being passed to [`Store::commit`] rolls back.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()>;

    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()> {
        drop(tx);
        Ok(())
    }
}

/// Group label → stable id.
#[async_trait]
pub trait GroupResolver: Store {
    /// Resolve `name` inside `tx`, creating the group on first reference.
    ///
    /// Blank or absent names resolve to `None` and create nothing. Concurrent
    /// first references to the same name converge on one id.
    async fn resolve_group(&self, tx: &mut Self::Tx, name: Option<&str>)
        -> StoreResult<Option<GroupId>>;
}

/// Idempotent result persistence keyed by job id.
#[async_trait]
pub trait ResultStore: Store {
    /// Insert the result, or overwrite `response` and `group_id` if the job
    /// already has one.
    async fn upsert_result(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        response: &JsonValue,
        group_id: Option<GroupId>,
    ) -> StoreResult<()>;
}

/// The queue engine contract used by the enqueuer and the worker pool.
#[async_trait]
pub trait JobQueue: Store {
    /// Insert one job in its own transaction.
    async fn insert(&self, params: InsertParams) -> StoreResult<JobId>;

    /// Insert a batch inside the caller's transaction.
    async fn insert_many(&self, tx: &mut Self::Tx, params: Vec<InsertParams>)
        -> StoreResult<Vec<JobId>>;

    /// Claim the next ready job, moving it to `running` and bumping `attempt`.
    async fn claim(&self, worker: &str) -> StoreResult<Option<QueuedJob>>;

    /// Mark a claimed job completed inside the caller's transaction.
    ///
    /// Fails with `NotHeld` unless the job is still `running` under the
    /// attempt recorded in `job`.
    async fn complete(&self, tx: &mut Self::Tx, job: &QueuedJob) -> StoreResult<()>;

    /// Record a failed attempt; returns the state the job moved to.
    async fn record_failure(&self, job: &QueuedJob, error: &str) -> StoreResult<JobState>;

    /// Return jobs stuck in `running` for longer than `older_than` to the queue.
    async fn rescue_stuck(&self, older_than: Duration) -> StoreResult<u64>;

    /// Delete completed jobs finalized more than `older_than` ago.
    async fn prune_completed(&self, older_than: Duration) -> StoreResult<u64>;

    async fn get_job(&self, id: JobId) -> StoreResult<Option<QueuedJob>>;
}

/// A stored result joined with its group name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub job_id: JobId,
    pub response: JsonValue,
    pub group_id: Option<GroupId>,
    pub group_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub result_count: u64,
}

/// Rows removed by a group purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GroupPurge {
    pub results_deleted: u64,
    pub groups_deleted: u64,
}

/// Read side of the results table.
#[async_trait]
pub trait ResultQuery: Send + Sync + 'static {
    /// Results created at or after `since` (all results when `None`).
    async fn count_results(&self, since: Option<DateTime<Utc>>) -> StoreResult<u64>;

    /// One keyset page ordered by job id, strictly after `after`.
    async fn results_page(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<JobId>,
        limit: usize,
    ) -> StoreResult<Vec<ResultRecord>>;

    /// Which of `ids` have a result created at or after `since`.
    async fn existing_result_ids(
        &self,
        since: Option<DateTime<Utc>>,
        ids: &[JobId],
    ) -> StoreResult<Vec<JobId>>;

    /// Most recent results first.
    async fn latest_results(&self, limit: usize) -> StoreResult<Vec<ResultRecord>>;

    async fn group_results(&self, group: GroupId) -> StoreResult<Vec<ResultRecord>>;

    async fn group_summaries(&self) -> StoreResult<Vec<GroupSummary>>;

    /// Delete a group and every result referencing it, atomically.
    async fn delete_group(&self, group: GroupId) -> StoreResult<GroupPurge>;
}

/// Which end of the completed list to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    First,
    Last,
}

/// Operator views over the jobs table.
#[async_trait]
pub trait QueueAdmin: Send + Sync + 'static {
    async fn count_jobs(&self, states: &[JobState]) -> StoreResult<u64>;

    /// Jobs in `states`, ordered by finalization time (creation time for
    /// unfinalized jobs) from the requested end.
    async fn list_jobs(&self, states: &[JobState], end: ListEnd, limit: usize)
        -> StoreResult<Vec<QueuedJob>>;

    async fn delete_jobs(&self, states: &[JobState]) -> StoreResult<u64>;

    /// Queued jobs that have already failed at least one attempt, newest first,
    /// with their total count.
    async fn failed_attempts(&self, limit: usize) -> StoreResult<(u64, Vec<QueuedJob>)>;
}
