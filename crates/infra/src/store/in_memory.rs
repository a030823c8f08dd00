//! In-memory store for tests and local experiments.
//!
//! Transactions take an exclusive lock on the whole state and keep a snapshot;
//! a transaction dropped without commit restores the snapshot. Writers are
//! fully serialized.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use dprompts_core::{GroupId, JobId};

use crate::error::{StoreError, StoreResult};
use crate::jobs::{AttemptError, InsertParams, JobState, QueuedJob, RetryPolicy};

use super::r#trait::{
    GroupPurge, GroupResolver, GroupSummary, JobQueue, ListEnd, QueueAdmin, ResultQuery,
    ResultRecord, ResultStore, Store,
};

/// Operation that should fail the next time it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    ResolveGroup,
    UpsertResult,
    Complete,
    InsertMany,
    Commit,
}

#[derive(Debug, Clone)]
struct GroupRow {
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ResultRow {
    response: JsonValue,
    group_id: Option<GroupId>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    jobs: BTreeMap<JobId, QueuedJob>,
    groups: BTreeMap<GroupId, GroupRow>,
    results: BTreeMap<JobId, ResultRow>,
    next_job_id: i64,
    next_group_id: i64,
}

impl MemoryState {
    fn insert_job(&mut self, params: InsertParams, policy: &RetryPolicy) -> JobId {
        self.next_job_id += 1;
        let id = JobId::new(self.next_job_id);
        self.jobs
            .insert(id, QueuedJob::from_insert(id, params, policy, Utc::now()));
        id
    }

    fn record(&self, job_id: JobId, row: &ResultRow) -> ResultRecord {
        ResultRecord {
            job_id,
            response: row.response.clone(),
            group_id: row.group_id,
            group_name: row
                .group_id
                .and_then(|id| self.groups.get(&id))
                .map(|g| g.name.clone()),
            created_at: row.created_at,
        }
    }
}

/// Open transaction on an [`InMemoryStore`].
pub struct MemoryTx {
    state: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.state = snapshot;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<AsyncMutex<MemoryState>>,
    faults: Arc<Mutex<Vec<FailPoint>>>,
    retry: RetryPolicy,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next run of `point` fail with a database error.
    pub fn fail_next(&self, point: FailPoint) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(point);
    }

    fn check_fault(&self, point: FailPoint) -> StoreResult<()> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        match faults.iter().position(|p| *p == point) {
            Some(index) => {
                faults.remove(index);
                Err(StoreError::database(
                    &format!("{point:?}"),
                    "injected failure",
                ))
            }
            None => Ok(()),
        }
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn result_count(&self) -> usize {
        self.state.lock().await.results.len()
    }

    pub async fn group_count(&self) -> usize {
        self.state.lock().await.groups.len()
    }

    pub async fn result(&self, job_id: JobId) -> Option<ResultRecord> {
        let state = self.state.lock().await;
        state.results.get(&job_id).map(|row| state.record(job_id, row))
    }

    /// Overwrite a result's creation time.
    pub async fn set_result_created_at(&self, job_id: JobId, at: DateTime<Utc>) {
        if let Some(row) = self.state.lock().await.results.get_mut(&job_id) {
            row.created_at = at;
        }
    }

    /// Move a job's claim time into the past, as if its worker had stalled.
    pub async fn set_attempted_at(&self, job_id: JobId, at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.attempted_at = Some(at);
        }
    }

    /// Make a job claimable now regardless of its backoff.
    pub async fn make_due(&self, job_id: JobId) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.scheduled_at = Utc::now();
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        let state = self.state.clone().lock_owned().await;
        let snapshot = Some(state.clone());
        Ok(MemoryTx { state, snapshot })
    }

    async fn commit(&self, mut tx: MemoryTx) -> StoreResult<()> {
        // Dropping `tx` on the error path restores the snapshot.
        self.check_fault(FailPoint::Commit)?;
        tx.snapshot = None;
        Ok(())
    }
}

#[async_trait]
impl GroupResolver for InMemoryStore {
    async fn resolve_group(
        &self,
        tx: &mut MemoryTx,
        name: Option<&str>,
    ) -> StoreResult<Option<GroupId>> {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        self.check_fault(FailPoint::ResolveGroup)?;

        let state = &mut *tx.state;
        if let Some((id, _)) = state.groups.iter().find(|(_, g)| g.name == name) {
            return Ok(Some(*id));
        }

        state.next_group_id += 1;
        let id = GroupId::new(state.next_group_id);
        state.groups.insert(
            id,
            GroupRow {
                name: name.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(Some(id))
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn upsert_result(
        &self,
        tx: &mut MemoryTx,
        job_id: JobId,
        response: &JsonValue,
        group_id: Option<GroupId>,
    ) -> StoreResult<()> {
        self.check_fault(FailPoint::UpsertResult)?;

        let state = &mut *tx.state;
        if let Some(group) = group_id {
            if !state.groups.contains_key(&group) {
                return Err(StoreError::database(
                    "upsert_result",
                    "foreign key violation: unknown group",
                ));
            }
        }

        match state.results.get_mut(&job_id) {
            Some(row) => {
                row.response = response.clone();
                row.group_id = group_id;
            }
            None => {
                state.results.insert(
                    job_id,
                    ResultRow {
                        response: response.clone(),
                        group_id,
                        created_at: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryStore {
    async fn insert(&self, params: InsertParams) -> StoreResult<JobId> {
        let mut state = self.state.lock().await;
        Ok(state.insert_job(params, &self.retry))
    }

    async fn insert_many(
        &self,
        tx: &mut MemoryTx,
        params: Vec<InsertParams>,
    ) -> StoreResult<Vec<JobId>> {
        self.check_fault(FailPoint::InsertMany)?;
        Ok(params
            .into_iter()
            .map(|p| tx.state.insert_job(p, &self.retry))
            .collect())
    }

    async fn claim(&self, worker: &str) -> StoreResult<Option<QueuedJob>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| (j.scheduled_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = state.jobs.get_mut(&id)?;
            job.mark_running(worker, now);
            Some(job.clone())
        }))
    }

    async fn complete(&self, tx: &mut MemoryTx, job: &QueuedJob) -> StoreResult<()> {
        self.check_fault(FailPoint::Complete)?;

        match tx.state.jobs.get_mut(&job.id) {
            Some(row) if row.state == JobState::Running && row.attempt == job.attempt => {
                row.mark_completed(Utc::now());
                Ok(())
            }
            _ => Err(StoreError::NotHeld(job.id)),
        }
    }

    async fn record_failure(&self, job: &QueuedJob, error: &str) -> StoreResult<JobState> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        match state.jobs.get_mut(&job.id) {
            Some(row) if row.state == JobState::Running && row.attempt == job.attempt => {
                let transition = row.failure_transition(&self.retry, now);
                row.apply_failure(transition, error, now);
                Ok(row.state)
            }
            _ => Err(StoreError::NotHeld(job.id)),
        }
    }

    async fn rescue_stuck(&self, older_than: Duration) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(older_than).unwrap_or_default();

        let mut rescued = 0;
        for job in state.jobs.values_mut() {
            let stuck = job.state == JobState::Running
                && job.attempted_at.is_some_and(|at| at < cutoff);
            if !stuck {
                continue;
            }
            job.errors.push(AttemptError {
                attempt: job.attempt,
                at: now,
                error: "attempt exceeded its deadline and was rescued".to_string(),
            });
            if job.attempt >= job.max_attempts {
                job.state = JobState::Discarded;
                job.finalized_at = Some(now);
            } else {
                job.state = JobState::Retryable;
                job.scheduled_at = now;
            }
            rescued += 1;
        }
        Ok(rescued)
    }

    async fn prune_completed(&self, older_than: Duration) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.state == JobState::Completed && job.finalized_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<QueuedJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }
}

fn in_window(created_at: DateTime<Utc>, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |since| created_at >= since)
}

#[async_trait]
impl ResultQuery for InMemoryStore {
    async fn count_results(&self, since: Option<DateTime<Utc>>) -> StoreResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .results
            .values()
            .filter(|r| in_window(r.created_at, since))
            .count() as u64)
    }

    async fn results_page(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<JobId>,
        limit: usize,
    ) -> StoreResult<Vec<ResultRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .results
            .iter()
            .filter(|(id, row)| after.map_or(true, |a| **id > a) && in_window(row.created_at, since))
            .take(limit)
            .map(|(id, row)| state.record(*id, row))
            .collect())
    }

    async fn existing_result_ids(
        &self,
        since: Option<DateTime<Utc>>,
        ids: &[JobId],
    ) -> StoreResult<Vec<JobId>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| {
                state
                    .results
                    .get(id)
                    .is_some_and(|row| in_window(row.created_at, since))
            })
            .collect())
    }

    async fn latest_results(&self, limit: usize) -> StoreResult<Vec<ResultRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .results
            .iter()
            .map(|(id, row)| state.record(*id, row))
            .collect();
        records.sort_by(|a, b| (b.created_at, b.job_id).cmp(&(a.created_at, a.job_id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn group_results(&self, group: GroupId) -> StoreResult<Vec<ResultRecord>> {
        let state = self.state.lock().await;
        if !state.groups.contains_key(&group) {
            return Err(StoreError::GroupNotFound(group));
        }
        let mut records: Vec<_> = state
            .results
            .iter()
            .filter(|(_, row)| row.group_id == Some(group))
            .map(|(id, row)| state.record(*id, row))
            .collect();
        records.sort_by(|a, b| (b.created_at, b.job_id).cmp(&(a.created_at, a.job_id)));
        Ok(records)
    }

    async fn group_summaries(&self) -> StoreResult<Vec<GroupSummary>> {
        let state = self.state.lock().await;
        Ok(state
            .groups
            .iter()
            .map(|(id, group)| GroupSummary {
                id: *id,
                name: group.name.clone(),
                created_at: group.created_at,
                result_count: state
                    .results
                    .values()
                    .filter(|r| r.group_id == Some(*id))
                    .count() as u64,
            })
            .collect())
    }

    async fn delete_group(&self, group: GroupId) -> StoreResult<GroupPurge> {
        let mut state = self.state.lock().await;
        if state.groups.remove(&group).is_none() {
            return Err(StoreError::GroupNotFound(group));
        }
        let before = state.results.len();
        state.results.retain(|_, row| row.group_id != Some(group));
        Ok(GroupPurge {
            results_deleted: (before - state.results.len()) as u64,
            groups_deleted: 1,
        })
    }
}

fn list_key(job: &QueuedJob) -> (DateTime<Utc>, JobId) {
    (job.finalized_at.unwrap_or(job.created_at), job.id)
}

#[async_trait]
impl QueueAdmin for InMemoryStore {
    async fn count_jobs(&self, states: &[JobState]) -> StoreResult<u64> {
        let state = self.state.lock().await;
        Ok(state.jobs.values().filter(|j| states.contains(&j.state)).count() as u64)
    }

    async fn list_jobs(
        &self,
        states: &[JobState],
        end: ListEnd,
        limit: usize,
    ) -> StoreResult<Vec<QueuedJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| states.contains(&j.state))
            .cloned()
            .collect();
        jobs.sort_by_key(list_key);
        if end == ListEnd::Last {
            jobs.reverse();
        }
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn delete_jobs(&self, states: &[JobState]) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, j| !states.contains(&j.state));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn failed_attempts(&self, limit: usize) -> StoreResult<(u64, Vec<QueuedJob>)> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.state.is_queued() && j.attempt > 0)
            .cloned()
            .collect();
        let total = jobs.len() as u64;
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        jobs.truncate(limit);
        Ok((total, jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dprompts_core::{JobSpec, SchemaRegistry};
    use serde_json::json;

    fn params(prompt: &str) -> InsertParams {
        let (args, _) = JobSpec::single(prompt)
            .into_args(&SchemaRegistry::empty())
            .unwrap();
        InsertParams::new(args)
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let store = InMemoryStore::new();
        let id = store.insert(params("a")).await.unwrap();

        let claimed = store.claim("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.attempted_by.as_deref(), Some("w1"));

        // No more jobs
        assert!(store.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            store.insert_many(&mut tx, vec![params("a"), params("b")]).await.unwrap();
        }
        assert_eq!(store.job_count().await, 0);

        let mut tx = store.begin().await.unwrap();
        store.insert_many(&mut tx, vec![params("a")]).await.unwrap();
        store.commit(tx).await.unwrap();
        assert_eq!(store.job_count().await, 1);
    }

    #[tokio::test]
    async fn failed_commit_rolls_back() {
        let store = InMemoryStore::new();
        store.fail_next(FailPoint::Commit);

        let mut tx = store.begin().await.unwrap();
        store.resolve_group(&mut tx, Some("g")).await.unwrap();
        assert!(store.commit(tx).await.is_err());
        assert_eq!(store.group_count().await, 0);
    }

    #[tokio::test]
    async fn complete_requires_current_attempt() {
        let store = InMemoryStore::new();
        store.insert(params("a")).await.unwrap();
        let claimed = store.claim("w1").await.unwrap().unwrap();

        let mut stale = claimed.clone();
        stale.attempt = 0;
        let mut tx = store.begin().await.unwrap();
        let err = store.complete(&mut tx, &stale).await.unwrap_err();
        assert!(matches!(err, StoreError::NotHeld(_)));

        store.complete(&mut tx, &claimed).await.unwrap();
        store.commit(tx).await.unwrap();
        let job = store.get_job(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.finalized_at.is_some());
    }

    #[tokio::test]
    async fn upsert_overwrites() {
        let store = InMemoryStore::new();
        let job = JobId::new(7);

        let mut tx = store.begin().await.unwrap();
        store.upsert_result(&mut tx, job, &json!({"response": "one"}), None).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let group = store.resolve_group(&mut tx, Some("g")).await.unwrap();
        store.upsert_result(&mut tx, job, &json!({"response": "two"}), group).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(store.result_count().await, 1);
        let record = store.result(job).await.unwrap();
        assert_eq!(record.response, json!({"response": "two"}));
        assert_eq!(record.group_name.as_deref(), Some("g"));
    }

    #[tokio::test]
    async fn failures_back_off_then_discard() {
        let store = InMemoryStore::new()
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_secs(60)));
        let id = store.insert(params("a")).await.unwrap();

        let job = store.claim("w1").await.unwrap().unwrap();
        assert_eq!(store.record_failure(&job, "boom").await.unwrap(), JobState::Retryable);
        // Backoff keeps it out of reach
        assert!(store.claim("w1").await.unwrap().is_none());

        store.make_due(id).await;
        let job = store.claim("w1").await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(store.record_failure(&job, "boom").await.unwrap(), JobState::Discarded);

        let (count, _) = store.failed_attempts(10).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn rescue_returns_stuck_jobs() {
        let store = InMemoryStore::new();
        let id = store.insert(params("a")).await.unwrap();
        let job = store.claim("w1").await.unwrap().unwrap();

        assert_eq!(store.rescue_stuck(Duration::from_secs(60)).await.unwrap(), 0);
        store
            .set_attempted_at(id, Utc::now() - chrono::Duration::minutes(10))
            .await;
        assert_eq!(store.rescue_stuck(Duration::from_secs(60)).await.unwrap(), 1);

        let rescued = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(rescued.state, JobState::Retryable);
        assert_eq!(rescued.errors.len(), 1);

        // The stalled worker can no longer complete it
        let mut tx = store.begin().await.unwrap();
        assert!(store.complete(&mut tx, &job).await.is_err());
    }

    #[tokio::test]
    async fn admin_views() {
        let store = InMemoryStore::new();
        for p in ["a", "b", "c"] {
            store.insert(params(p)).await.unwrap();
        }
        let job = store.claim("w1").await.unwrap().unwrap();
        let mut tx = store.begin().await.unwrap();
        store.complete(&mut tx, &job).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(store.count_jobs(&JobState::QUEUED).await.unwrap(), 2);
        assert_eq!(store.count_jobs(&[JobState::Completed]).await.unwrap(), 1);

        let last = store.list_jobs(&JobState::QUEUED, ListEnd::Last, 1).await.unwrap();
        assert_eq!(last[0].id, JobId::new(3));

        assert_eq!(store.delete_jobs(&JobState::QUEUED).await.unwrap(), 2);
        assert_eq!(store.job_count().await, 1);
    }

    #[tokio::test]
    async fn delete_group_cascades() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let g = store.resolve_group(&mut tx, Some("g")).await.unwrap();
        store.upsert_result(&mut tx, JobId::new(1), &json!({}), g).await.unwrap();
        store.upsert_result(&mut tx, JobId::new(2), &json!({}), g).await.unwrap();
        store.upsert_result(&mut tx, JobId::new(3), &json!({}), None).await.unwrap();
        store.commit(tx).await.unwrap();

        let purge = store.delete_group(g.unwrap()).await.unwrap();
        assert_eq!(purge, GroupPurge { results_deleted: 2, groups_deleted: 1 });
        assert_eq!(store.result_count().await, 1);
        assert!(store.delete_group(g.unwrap()).await.is_err());
    }
}
