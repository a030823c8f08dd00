use sqlx::PgConnection;
use tracing::debug;

use dprompts_core::GroupId;

use crate::error::{map_sqlx_error, StoreError, StoreResult};

/// Insert/lookup rounds before giving up on a name.
const RESOLVE_ATTEMPTS: u32 = 3;

/// Race-safe "insert, then fetch on conflict".
///
/// Under read committed a conflicting insert blocks until the winner commits,
/// after which the lookup sees the winner's row. A miss after the conflict
/// means the winning row was deleted in between, so the pair is retried.
pub(super) async fn resolve(conn: &mut PgConnection, name: &str) -> StoreResult<GroupId> {
    for attempt in 1..=RESOLVE_ATTEMPTS {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO dprompt_groups (group_name)
            VALUES ($1)
            ON CONFLICT (group_name) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_group", e))?;

        if let Some(id) = inserted {
            debug!(group_id = id, "created group");
            return Ok(GroupId::new(id));
        }

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM dprompt_groups WHERE group_name = $1")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("select_group", e))?;

        if let Some(id) = existing {
            return Ok(GroupId::new(id));
        }

        debug!(attempt, "group disappeared between insert and lookup");
    }

    Err(StoreError::GroupUnresolved(name.to_string()))
}
