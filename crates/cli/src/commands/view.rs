use anyhow::Context;

use dprompts_infra::{ResultView, ResultViewer};

use crate::args::ViewCommand;
use crate::context::AppContext;

use super::local;

pub async fn run(ctx: &AppContext, command: ViewCommand) -> anyhow::Result<()> {
    let viewer = ResultViewer::new(ctx.store().await?);

    match command {
        ViewCommand::Results { n } => {
            let results = viewer.latest(n).await.context("reading latest results")?;
            print_results(&results);
        }
        ViewCommand::Group { id } => {
            let results = viewer
                .group(id)
                .await
                .with_context(|| format!("reading results of group {id}"))?;
            println!("Group {id}: {} results\n", results.len());
            print_results(&results);
        }
        ViewCommand::Groups => {
            let groups = viewer.groups().await.context("reading groups")?;
            println!("Groups: {}", groups.len());
            for group in groups {
                println!(
                    "ID: {} | Name: {} | Results: {} | CreatedAt: {}",
                    group.id,
                    group.name,
                    group.result_count,
                    local(group.created_at)
                );
            }
        }
    }
    Ok(())
}

fn print_results(results: &[ResultView]) {
    if results.is_empty() {
        println!("No results.");
    }
    for result in results {
        println!("{result}");
    }
}
