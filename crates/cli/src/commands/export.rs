use anyhow::Context;

use dprompts_infra::{ExportOptions, ExportWindow, Exporter};

use crate::args::ExportArgs;
use crate::context::AppContext;

pub async fn run(ctx: &AppContext, args: ExportArgs) -> anyhow::Result<()> {
    let window = ExportWindow::from_flags(args.full_export, args.from_date.as_deref())?;
    let options = ExportOptions::new(args.out_dir)
        .with_window(window)
        .with_format(args.format)
        .with_dry_run(args.dry_run)
        .with_overwrite(args.overwrite);

    let exporter = Exporter::new(ctx.store().await?);
    let summary = match exporter.export(&options).await {
        Ok(summary) => summary,
        Err(err) => {
            println!("Exported before failure: {}", err.exported());
            return Err(err).context("export failed");
        }
    };

    println!("Matched: {}", summary.matched);
    println!("Already exported: {}", summary.already_exported);
    if options.dry_run {
        println!("Would export: {}", summary.exported);
    } else {
        println!("Exported: {} -> {}", summary.exported, options.out_dir.display());
    }
    Ok(())
}
