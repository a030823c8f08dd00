use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use dprompts_ai::OllamaClient;
use dprompts_infra::{JobRunner, WorkerPool, WorkerPoolConfig};

use crate::args::WorkerArgs;
use crate::context::AppContext;
use crate::shutdown::install_shutdown_handler;

pub async fn run(ctx: &AppContext, args: WorkerArgs) -> anyhow::Result<()> {
    let llm = OllamaClient::new(ctx.config.llm.clone()).context("building LLM client")?;
    if ctx.config.llm.autostart && !llm.ensure_running().await {
        warn!("generation service is not answering; jobs will fail and retry until it is");
    }

    let store = ctx.store().await?;
    let settings = &ctx.config.worker;
    let runner = Arc::new(
        JobRunner::new(store, llm)
            .with_attempt_timeout(Duration::from_secs(settings.attempt_timeout_secs)),
    );

    let mut config = WorkerPoolConfig::from_settings(settings);
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }

    let shutdown = install_shutdown_handler()?;
    let handle = WorkerPool::spawn(runner, config, shutdown);
    let stats = handle.join().await;

    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        discarded = stats.discarded,
        uptime_secs = stats.uptime_secs,
        "worker exited"
    );
    Ok(())
}
