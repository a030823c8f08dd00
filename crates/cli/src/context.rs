use std::path::Path;

use anyhow::Context;

use dprompts_core::SchemaRegistry;
use dprompts_infra::jobs::RetryPolicy;
use dprompts_infra::{db, AppConfig, PgStore};

/// Loaded configuration plus, for commands that need it, a bootstrapped
/// database.
pub struct AppContext {
    pub config: AppConfig,
}

impl AppContext {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = AppConfig::load(path).context("loading configuration")?;
        Ok(Self { config })
    }

    pub fn schemas(&self) -> anyhow::Result<SchemaRegistry> {
        self.config
            .schema_registry()
            .context("loading named schemas")
    }

    /// Connect, create the tables if needed, and wrap the pool in a store.
    pub async fn store(&self) -> anyhow::Result<PgStore> {
        let pool = db::connect(&self.config.database)
            .await
            .context("connecting to Postgres")?;
        db::bootstrap(&pool)
            .await
            .context("creating database tables")?;

        let retry = RetryPolicy::default().with_max_attempts(self.config.worker.max_attempts);
        Ok(PgStore::new(pool).with_retry_policy(retry))
    }
}
