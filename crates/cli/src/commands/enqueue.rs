use anyhow::Context;

use dprompts_infra::Enqueuer;

use crate::args::EnqueueArgs;
use crate::context::AppContext;

pub async fn run(ctx: &AppContext, args: EnqueueArgs) -> anyhow::Result<()> {
    let schemas = ctx.schemas()?;
    let enqueuer = Enqueuer::new(ctx.store().await?, schemas);

    match (args.bulk_from_file, args.args) {
        (Some(path), _) => {
            let summary = enqueuer
                .enqueue_file(&path)
                .await
                .with_context(|| format!("bulk enqueue from {}", path.display()))?;
            println!(
                "Inserted {} jobs in {} batches",
                summary.inserted, summary.batches
            );
        }
        (None, Some(spec)) => {
            let id = enqueuer
                .enqueue_json(&spec, args.metadata.as_deref())
                .await
                .context("enqueueing job")?;
            println!("Enqueued job {id}");
        }
        (None, None) => anyhow::bail!("either --args or --bulk-from-file is required"),
    }
    Ok(())
}
