use anyhow::Context;

use dprompts_ai::OllamaClient;

use crate::args::LlmCommand;
use crate::context::AppContext;

pub async fn run(ctx: &AppContext, command: LlmCommand) -> anyhow::Result<()> {
    match command {
        LlmCommand::Probe => {
            let client = OllamaClient::new(ctx.config.llm.clone()).context("building LLM client")?;
            client
                .probe()
                .await
                .with_context(|| format!("probing {}", ctx.config.llm.api_endpoint))?;
            println!(
                "Generation service is up ({}, model {})",
                ctx.config.llm.api_endpoint, ctx.config.llm.model
            );
        }
    }
    Ok(())
}
