use serde_json::Value as JsonValue;
use sqlx::PgConnection;

use dprompts_core::{GroupId, JobId};

use crate::error::{map_sqlx_error, StoreResult};

pub(super) async fn upsert(
    conn: &mut PgConnection,
    job_id: JobId,
    response: &JsonValue,
    group_id: Option<GroupId>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dprompt_results (job_id, response, group_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (job_id) DO UPDATE
        SET response = EXCLUDED.response,
            group_id = EXCLUDED.group_id
        "#,
    )
    .bind(job_id.get())
    .bind(response)
    .bind(group_id.map(GroupId::get))
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("upsert_result", e))?;

    Ok(())
}
