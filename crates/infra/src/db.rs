//! Connection pool and schema bootstrap.

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{map_sqlx_error, StoreError};

/// Tables and indexes owned by this system. Every statement is idempotent.
///
/// `dprompt_results.job_id` carries no foreign key: completed jobs are pruned
/// after their retention period while their results stay.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dprompt_jobs (
        id            BIGSERIAL PRIMARY KEY,
        kind          TEXT        NOT NULL,
        queue         TEXT        NOT NULL DEFAULT 'default',
        args          JSONB       NOT NULL,
        metadata      JSONB       NULL,
        state         TEXT        NOT NULL DEFAULT 'available'
            CHECK (state IN ('available', 'scheduled', 'running', 'retryable',
                             'completed', 'cancelled', 'discarded')),
        attempt       INTEGER     NOT NULL DEFAULT 0,
        max_attempts  INTEGER     NOT NULL CHECK (max_attempts > 0),
        errors        JSONB       NOT NULL DEFAULT '[]'::jsonb,
        attempted_by  TEXT        NULL,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        scheduled_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        attempted_at  TIMESTAMPTZ NULL,
        finalized_at  TIMESTAMPTZ NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS dprompt_jobs_fetch_idx ON dprompt_jobs (state, scheduled_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS dprompt_groups (
        id          BIGSERIAL PRIMARY KEY,
        group_name  TEXT        NOT NULL UNIQUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dprompt_results (
        id          BIGSERIAL PRIMARY KEY,
        job_id      BIGINT      NOT NULL UNIQUE,
        response    JSONB       NOT NULL,
        group_id    BIGINT      NULL REFERENCES dprompt_groups (id) ON DELETE CASCADE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS dprompt_results_created_idx ON dprompt_results (created_at)",
    "CREATE INDEX IF NOT EXISTS dprompt_results_group_idx ON dprompt_results (group_id)",
];

const BOOTSTRAP_LOCK_KEY: i64 = 0x6470_726f_6d70;

/// Open a pool sized by `config` and check it with one round trip.
#[instrument(skip(config), fields(max = config.max_connections, min = config.min_connections), err)]
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let options = config
        .connect_options()
        .map_err(|e| StoreError::database("connect", e.to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(config.max_lifetime())
        .idle_timeout(config.idle_timeout())
        .acquire_timeout(config.acquire_timeout())
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("ping", e))?;

    info!("database connection established");
    Ok(pool)
}

/// Create the tables if they do not exist.
#[instrument(skip(pool), err)]
pub async fn bootstrap(pool: &PgPool) -> Result<(), StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    // Serializes concurrent bootstraps; CREATE ... IF NOT EXISTS alone can race.
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(BOOTSTRAP_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("bootstrap_lock", e))?;

    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("bootstrap_schema", e))?;
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}
