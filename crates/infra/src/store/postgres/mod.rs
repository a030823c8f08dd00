//! Postgres-backed store.
//!
//! Jobs live in `dprompt_jobs` and are claimed with `FOR UPDATE SKIP LOCKED`,
//! so concurrent workers never receive the same job. Group resolution, result
//! upsert and completion all run on the caller's `Transaction`, which is what
//! makes a worker attempt atomic.

mod groups;
mod query;
mod results;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};

use dprompts_core::{GroupId, JobId, JOB_KIND};

use crate::error::{map_sqlx_error, StoreError, StoreResult};
use crate::jobs::{AttemptError, InsertParams, JobState, QueuedJob, RetryPolicy};

use super::r#trait::{GroupResolver, JobQueue, ResultStore, Store};

pub(crate) const JOB_COLUMNS: &str = "id, kind, queue, args, metadata, state, attempt, \
     max_attempts, errors, attempted_by, created_at, scheduled_at, attempted_at, finalized_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

pub(crate) fn column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(|e| map_sqlx_error("decode_row", e))
}

pub(crate) fn job_from_row(row: &PgRow) -> StoreResult<QueuedJob> {
    let state: String = column(row, "state")?;
    let args: JsonValue = column(row, "args")?;
    let errors: JsonValue = column(row, "errors")?;
    let attempt: i32 = column(row, "attempt")?;
    let max_attempts: i32 = column(row, "max_attempts")?;

    Ok(QueuedJob {
        id: JobId::new(column(row, "id")?),
        kind: column(row, "kind")?,
        queue: column(row, "queue")?,
        args: serde_json::from_value(args)?,
        metadata: column(row, "metadata")?,
        state: state.parse().map_err(StoreError::Serialization)?,
        attempt: attempt.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        errors: serde_json::from_value(errors)?,
        attempted_by: column(row, "attempted_by")?,
        created_at: column(row, "created_at")?,
        scheduled_at: column(row, "scheduled_at")?,
        attempted_at: column(row, "attempted_at")?,
        finalized_at: column(row, "finalized_at")?,
    })
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[async_trait]
impl Store for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

#[async_trait]
impl GroupResolver for PgStore {
    #[instrument(skip(self, tx), err)]
    async fn resolve_group(
        &self,
        tx: &mut Self::Tx,
        name: Option<&str>,
    ) -> StoreResult<Option<GroupId>> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => groups::resolve(&mut **tx, name).await.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResultStore for PgStore {
    #[instrument(skip(self, tx, response), fields(job_id = %job_id), err)]
    async fn upsert_result(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        response: &JsonValue,
        group_id: Option<GroupId>,
    ) -> StoreResult<()> {
        results::upsert(&mut **tx, job_id, response, group_id).await
    }
}

#[async_trait]
impl JobQueue for PgStore {
    #[instrument(skip(self, params), err)]
    async fn insert(&self, params: InsertParams) -> StoreResult<JobId> {
        let now = Utc::now();
        let state = params.initial_state(now);
        let args = serde_json::to_value(&params.args)?;
        let max_attempts = params.max_attempts.unwrap_or(self.retry.max_attempts) as i32;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dprompt_jobs (kind, queue, args, metadata, state, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, now()))
            RETURNING id
            "#,
        )
        .bind(JOB_KIND)
        .bind(&params.queue)
        .bind(args)
        .bind(&params.metadata)
        .bind(state.as_str())
        .bind(max_attempts)
        .bind(params.scheduled_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        Ok(JobId::new(id))
    }

    #[instrument(skip(self, tx, params), fields(count = params.len()), err)]
    async fn insert_many(
        &self,
        tx: &mut Self::Tx,
        params: Vec<InsertParams>,
    ) -> StoreResult<Vec<JobId>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut queues = Vec::with_capacity(params.len());
        let mut args = Vec::with_capacity(params.len());
        let mut metadata = Vec::with_capacity(params.len());
        let mut states = Vec::with_capacity(params.len());
        let mut max_attempts = Vec::with_capacity(params.len());
        let mut scheduled = Vec::with_capacity(params.len());

        for p in params {
            states.push(p.initial_state(now).as_str().to_string());
            args.push(serde_json::to_value(&p.args)?);
            max_attempts.push(p.max_attempts.unwrap_or(self.retry.max_attempts) as i32);
            queues.push(p.queue);
            metadata.push(p.metadata);
            scheduled.push(p.scheduled_at);
        }

        let mut ids: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO dprompt_jobs (kind, queue, args, metadata, state, max_attempts, scheduled_at)
            SELECT $1, t.queue, t.args, t.metadata, t.state, t.max_attempts, COALESCE(t.scheduled_at, now())
            FROM UNNEST($2::text[], $3::jsonb[], $4::jsonb[], $5::text[], $6::int4[], $7::timestamptz[])
                AS t(queue, args, metadata, state, max_attempts, scheduled_at)
            RETURNING id
            "#,
        )
        .bind(JOB_KIND)
        .bind(queues)
        .bind(args)
        .bind(metadata)
        .bind(states)
        .bind(max_attempts)
        .bind(scheduled)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_many_jobs", e))?;

        ids.sort_unstable();
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, worker: &str) -> StoreResult<Option<QueuedJob>> {
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM dprompt_jobs
                WHERE kind = $1
                  AND state IN ('available', 'scheduled', 'retryable')
                  AND scheduled_at <= now()
                ORDER BY scheduled_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE dprompt_jobs j
            SET state = 'running',
                attempt = j.attempt + 1,
                attempted_at = now(),
                attempted_by = $2
            FROM next_job
            WHERE j.id = next_job.id
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let row = sqlx::query(&sql)
            .bind(JOB_KIND)
            .bind(worker)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, tx, job), fields(job_id = %job.id, attempt = job.attempt), err)]
    async fn complete(&self, tx: &mut Self::Tx, job: &QueuedJob) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE dprompt_jobs
            SET state = 'completed', finalized_at = now()
            WHERE id = $1 AND state = 'running' AND attempt = $2
            "#,
        )
        .bind(job.id.get())
        .bind(job.attempt as i32)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        if done.rows_affected() == 0 {
            return Err(StoreError::NotHeld(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id, attempt = job.attempt), err)]
    async fn record_failure(&self, job: &QueuedJob, error: &str) -> StoreResult<JobState> {
        let now = Utc::now();
        let transition = job.failure_transition(&self.retry, now);
        let entry = serde_json::to_value(AttemptError {
            attempt: job.attempt,
            at: now,
            error: error.to_string(),
        })?;

        let updated = sqlx::query(
            r#"
            UPDATE dprompt_jobs
            SET state = $3,
                scheduled_at = COALESCE($4, scheduled_at),
                finalized_at = $5,
                errors = errors || jsonb_build_array($6::jsonb)
            WHERE id = $1 AND state = 'running' AND attempt = $2
            "#,
        )
        .bind(job.id.get())
        .bind(job.attempt as i32)
        .bind(transition.state.as_str())
        .bind(transition.scheduled_at)
        .bind(transition.finalized_at)
        .bind(entry)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotHeld(job.id));
        }
        Ok(transition.state)
    }

    #[instrument(skip(self), err)]
    async fn rescue_stuck(&self, older_than: Duration) -> StoreResult<u64> {
        let rescued = sqlx::query(
            r#"
            UPDATE dprompt_jobs
            SET state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'retryable' END,
                finalized_at = CASE WHEN attempt >= max_attempts THEN now() ELSE NULL END,
                scheduled_at = now(),
                errors = errors || jsonb_build_array(jsonb_build_object(
                    'attempt', attempt,
                    'at', now(),
                    'error', 'attempt exceeded its deadline and was rescued'
                ))
            WHERE state = 'running'
              AND attempted_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(seconds(older_than))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("rescue_stuck_jobs", e))?
        .rows_affected();

        if rescued > 0 {
            debug!(rescued, "returned stuck jobs to the queue");
        }
        Ok(rescued)
    }

    #[instrument(skip(self), err)]
    async fn prune_completed(&self, older_than: Duration) -> StoreResult<u64> {
        let pruned = sqlx::query(
            r#"
            DELETE FROM dprompt_jobs
            WHERE state = 'completed'
              AND finalized_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(seconds(older_than))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_completed_jobs", e))?
        .rows_affected();

        Ok(pruned)
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<QueuedJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM dprompt_jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }
}
