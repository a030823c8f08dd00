use anyhow::Context;

use dprompts_infra::store::ResultQuery;

use crate::args::GroupCommand;
use crate::context::AppContext;

use super::confirm;

pub async fn run(ctx: &AppContext, command: GroupCommand) -> anyhow::Result<()> {
    match command {
        GroupCommand::Delete { id, yes } => {
            if !yes && !confirm(&format!("Delete group {id} and all of its results?"))? {
                println!("Aborted.");
                return Ok(());
            }

            let store = ctx.store().await?;
            let purge = store
                .delete_group(id)
                .await
                .with_context(|| format!("deleting group {id}"))?;
            println!(
                "Deleted {} results and {} group(s) for group ID {id}",
                purge.results_deleted, purge.groups_deleted
            );
        }
    }
    Ok(())
}
