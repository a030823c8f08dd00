//! `dprompts` - queue prompts for a local LLM, run workers, export results.
//!
//! ```bash
//! dprompts enqueue --args '{"prompt": "Summarize ...", "group_name": "weekly"}'
//! dprompts enqueue --bulk-from-file jobs.ndjson
//! dprompts worker
//! dprompts export --from-date 2026-01-01 --out-dir exports
//! ```

use clap::Parser;

mod args;
mod commands;
mod context;
mod shutdown;

use args::{Cli, Command};
use context::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dprompts_observability::init(cli.log_format);

    let ctx = AppContext::load(cli.config.as_deref())?;

    match cli.command {
        Command::Worker(args) => commands::worker::run(&ctx, args).await,
        Command::Enqueue(args) => commands::enqueue::run(&ctx, args).await,
        Command::View(command) => commands::view::run(&ctx, command).await,
        Command::Export(args) => commands::export::run(&ctx, args).await,
        Command::Queue(command) => commands::queue::run(&ctx, command).await,
        Command::Group(command) => commands::group::run(&ctx, command).await,
        Command::Llm(command) => commands::llm::run(&ctx, command).await,
    }
}
