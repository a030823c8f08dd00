//! Read and administrative queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use tracing::{info, instrument};

use dprompts_core::{GroupId, JobId};

use crate::error::{map_sqlx_error, StoreError, StoreResult};
use crate::jobs::{JobState, QueuedJob};
use crate::store::r#trait::{
    GroupPurge, GroupSummary, ListEnd, QueueAdmin, ResultQuery, ResultRecord,
};

use super::{column, job_from_row, PgStore, JOB_COLUMNS};

const RESULT_SELECT: &str = r#"
    SELECT r.job_id, r.response, r.group_id, g.group_name, r.created_at
    FROM dprompt_results r
    LEFT JOIN dprompt_groups g ON g.id = r.group_id
"#;

fn record_from_row(row: &PgRow) -> StoreResult<ResultRecord> {
    let group_id: Option<i64> = column(row, "group_id")?;
    Ok(ResultRecord {
        job_id: JobId::new(column(row, "job_id")?),
        response: column(row, "response")?,
        group_id: group_id.map(GroupId::new),
        group_name: column(row, "group_name")?,
        created_at: column(row, "created_at")?,
    })
}

fn state_names(states: &[JobState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

impl PgStore {
    async fn group_exists(&self, group: GroupId) -> StoreResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM dprompt_groups WHERE id = $1)")
            .bind(group.get())
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("group_exists", e))
    }
}

#[async_trait]
impl ResultQuery for PgStore {
    #[instrument(skip(self), err)]
    async fn count_results(&self, since: Option<DateTime<Utc>>) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dprompt_results WHERE ($1::timestamptz IS NULL OR created_at >= $1)",
        )
        .bind(since)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_sqlx_error("count_results", e))?;

        Ok(count as u64)
    }

    #[instrument(skip(self), err)]
    async fn results_page(
        &self,
        since: Option<DateTime<Utc>>,
        after: Option<JobId>,
        limit: usize,
    ) -> StoreResult<Vec<ResultRecord>> {
        let rows = sqlx::query(&format!(
            r#"{RESULT_SELECT}
            WHERE ($1::timestamptz IS NULL OR r.created_at >= $1)
              AND ($2::bigint IS NULL OR r.job_id > $2)
            ORDER BY r.job_id
            LIMIT $3
            "#
        ))
        .bind(since)
        .bind(after.map(JobId::get))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("results_page", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, ids), fields(candidates = ids.len()), err)]
    async fn existing_result_ids(
        &self,
        since: Option<DateTime<Utc>>,
        ids: &[JobId],
    ) -> StoreResult<Vec<JobId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();

        let found: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT job_id FROM dprompt_results
            WHERE job_id = ANY($1)
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            "#,
        )
        .bind(raw)
        .bind(since)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("existing_result_ids", e))?;

        Ok(found.into_iter().map(JobId::new).collect())
    }

    #[instrument(skip(self), err)]
    async fn latest_results(&self, limit: usize) -> StoreResult<Vec<ResultRecord>> {
        let rows = sqlx::query(&format!(
            "{RESULT_SELECT} ORDER BY r.created_at DESC, r.job_id DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("latest_results", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(group_id = %group), err)]
    async fn group_results(&self, group: GroupId) -> StoreResult<Vec<ResultRecord>> {
        if !self.group_exists(group).await? {
            return Err(StoreError::GroupNotFound(group));
        }

        let rows = sqlx::query(&format!(
            "{RESULT_SELECT} WHERE r.group_id = $1 ORDER BY r.created_at DESC, r.job_id DESC"
        ))
        .bind(group.get())
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("group_results", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn group_summaries(&self) -> StoreResult<Vec<GroupSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.group_name, g.created_at, COUNT(r.job_id) AS result_count
            FROM dprompt_groups g
            LEFT JOIN dprompt_results r ON r.group_id = g.id
            GROUP BY g.id, g.group_name, g.created_at
            ORDER BY g.id
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("group_summaries", e))?;

        rows.iter()
            .map(|row| -> StoreResult<GroupSummary> {
                let count: i64 = column(row, "result_count")?;
                Ok(GroupSummary {
                    id: GroupId::new(column(row, "id")?),
                    name: column(row, "group_name")?,
                    created_at: column(row, "created_at")?,
                    result_count: count as u64,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(group_id = %group), err)]
    async fn delete_group(&self, group: GroupId) -> StoreResult<GroupPurge> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let results_deleted = sqlx::query("DELETE FROM dprompt_results WHERE group_id = $1")
            .bind(group.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_group_results", e))?
            .rows_affected();

        let groups_deleted = sqlx::query("DELETE FROM dprompt_groups WHERE id = $1")
            .bind(group.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_group", e))?
            .rows_affected();

        if groups_deleted == 0 {
            // Dropping `tx` rolls back.
            return Err(StoreError::GroupNotFound(group));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(results_deleted, "deleted group and its results");
        Ok(GroupPurge {
            results_deleted,
            groups_deleted,
        })
    }
}

#[async_trait]
impl QueueAdmin for PgStore {
    #[instrument(skip(self), err)]
    async fn count_jobs(&self, states: &[JobState]) -> StoreResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dprompt_jobs WHERE state = ANY($1)")
                .bind(state_names(states))
                .fetch_one(self.pool())
                .await
                .map_err(|e| map_sqlx_error("count_jobs", e))?;

        Ok(count as u64)
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(
        &self,
        states: &[JobState],
        end: ListEnd,
        limit: usize,
    ) -> StoreResult<Vec<QueuedJob>> {
        let direction = match end {
            ListEnd::First => "ASC",
            ListEnd::Last => "DESC",
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM dprompt_jobs
            WHERE state = ANY($1)
            ORDER BY COALESCE(finalized_at, created_at) {direction}, id {direction}
            LIMIT $2
            "#
        ))
        .bind(state_names(states))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_jobs(&self, states: &[JobState]) -> StoreResult<u64> {
        let deleted = sqlx::query("DELETE FROM dprompt_jobs WHERE state = ANY($1)")
            .bind(state_names(states))
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_jobs", e))?
            .rows_affected();

        Ok(deleted)
    }

    #[instrument(skip(self), err)]
    async fn failed_attempts(&self, limit: usize) -> StoreResult<(u64, Vec<QueuedJob>)> {
        let queued = state_names(&JobState::QUEUED);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dprompt_jobs WHERE state = ANY($1) AND attempt > 0",
        )
        .bind(&queued)
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_sqlx_error("count_failed_attempts", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM dprompt_jobs
            WHERE state = ANY($1) AND attempt > 0
            ORDER BY id DESC
            LIMIT $2
            "#
        ))
        .bind(&queued)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_failed_attempts", e))?;

        let jobs = rows.iter().map(job_from_row).collect::<StoreResult<Vec<_>>>()?;
        Ok((total as u64, jobs))
    }
}
