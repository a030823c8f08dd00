use anyhow::Context;

use dprompts_infra::store::{ListEnd, QueueAdmin};
use dprompts_infra::{JobState, QueuedJob};

use crate::args::QueueCommand;
use crate::context::AppContext;

use super::{confirm, local, local_opt};

pub async fn run(ctx: &AppContext, command: QueueCommand) -> anyhow::Result<()> {
    let store = ctx.store().await?;

    match command {
        QueueCommand::Count => {
            let count = store.count_jobs(&JobState::QUEUED).await.context("counting queued jobs")?;
            println!("Queued jobs: {count}");
        }
        QueueCommand::View { n } => {
            let jobs = store
                .list_jobs(&JobState::QUEUED, ListEnd::Last, n)
                .await
                .context("listing queued jobs")?;
            println!("Last {} queued jobs:", jobs.len());
            for job in &jobs {
                println!(
                    "ID: {} | State: {} | Attempt: {}/{} | CreatedAt: {} | ScheduledAt: {}",
                    job.id,
                    job.state,
                    job.attempt,
                    job.max_attempts,
                    local(job.created_at),
                    local(job.scheduled_at)
                );
            }
        }
        QueueCommand::Clear { yes } => {
            let count = store.count_jobs(&JobState::QUEUED).await.context("counting queued jobs")?;
            if count == 0 {
                println!("Queue is empty.");
                return Ok(());
            }
            if !yes && !confirm(&format!("Delete {count} queued jobs?"))? {
                println!("Aborted.");
                return Ok(());
            }
            let deleted = store
                .delete_jobs(&JobState::QUEUED)
                .await
                .context("clearing queued jobs")?;
            println!("Deleted {deleted} queued jobs");
        }
        QueueCommand::Completed { first, last } => {
            let completed = [JobState::Completed];
            let count = store.count_jobs(&completed).await.context("counting completed jobs")?;
            println!("Completed jobs: {count}");

            let listing = match (first, last) {
                (Some(n), _) => Some((ListEnd::First, n, "First")),
                (None, Some(n)) => Some((ListEnd::Last, n, "Last")),
                (None, None) => None,
            };
            if let Some((end, n, label)) = listing {
                let jobs = store
                    .list_jobs(&completed, end, n)
                    .await
                    .context("listing completed jobs")?;
                println!("{label} {} completed jobs:", jobs.len());
                for job in &jobs {
                    print_completed(job);
                }
            }
        }
        QueueCommand::Failed { n } => {
            let (total, jobs) = store
                .failed_attempts(n)
                .await
                .context("listing jobs with failed attempts")?;
            println!("Jobs with failed attempts: {total}");
            for job in &jobs {
                let last_error = job.errors.last().map(|e| e.error.as_str()).unwrap_or("-");
                println!(
                    "ID: {} | State: {} | Attempt: {}/{} | Kind: {} | CreatedAt: {} | AttemptedAt: {} | NextRun: {} | LastError: {}",
                    job.id,
                    job.state,
                    job.attempt,
                    job.max_attempts,
                    job.kind,
                    local(job.created_at),
                    local_opt(job.attempted_at),
                    local(job.scheduled_at),
                    last_error
                );
            }
        }
    }
    Ok(())
}

fn print_completed(job: &QueuedJob) {
    let args = serde_json::to_string(&job.args).unwrap_or_else(|_| "<unprintable>".to_string());
    println!(
        "ID: {} | CreatedAt: {} | CompletedAt: {} | Args: {}",
        job.id,
        local(job.created_at),
        local_opt(job.finalized_at),
        args
    );
}
