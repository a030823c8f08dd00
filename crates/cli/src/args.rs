use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use dprompts_core::GroupId;
use dprompts_infra::ExportFormat;
use dprompts_observability::LogFormat;

/// dprompts - queue prompts for a local LLM, run workers, export the answers
#[derive(Parser, Debug)]
#[command(name = "dprompts", version, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.dprompts.toml)
    #[arg(long, global = true, env = "DPROMPTS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format: pretty or json
    #[arg(long = "log-format", global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the worker pool until SIGINT or SIGTERM
    Worker(WorkerArgs),

    /// Enqueue one job, or a JSON array / NDJSON file of jobs
    Enqueue(EnqueueArgs),

    /// Show stored results
    #[command(subcommand)]
    View(ViewCommand),

    /// Write results to one file per job, skipping files already present
    Export(ExportArgs),

    /// Inspect or clear the job queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Manage result groups
    #[command(subcommand)]
    Group(GroupCommand),

    /// Generation service utilities
    #[command(subcommand)]
    Llm(LlmCommand),
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Override `worker.concurrency`
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Job specification as JSON
    #[arg(long, required_unless_present = "bulk_from_file", conflicts_with = "bulk_from_file")]
    pub args: Option<String>,

    /// Job metadata as JSON
    #[arg(long, requires = "args")]
    pub metadata: Option<String>,

    /// JSON array or NDJSON file of job specifications
    #[arg(long = "bulk-from-file")]
    pub bulk_from_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum ViewCommand {
    /// Most recent results
    Results {
        #[arg(short = 'n', long, default_value_t = 10)]
        n: usize,
    },
    /// Results of one group
    Group { id: GroupId },
    /// Every group with its result count
    Groups,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// json or text
    #[arg(long, default_value = "json")]
    pub format: ExportFormat,

    #[arg(long = "out-dir", default_value = "exports")]
    pub out_dir: PathBuf,

    /// Export results created on or after this date (YYYY-MM-DD)
    #[arg(long = "from-date")]
    pub from_date: Option<String>,

    /// Export every result regardless of date
    #[arg(long = "full-export")]
    pub full_export: bool,

    /// Report what would be exported without writing files
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Empty the output directory and export again
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Number of queued jobs
    Count,
    /// Most recently created queued jobs
    View {
        #[arg(short = 'n', long, default_value_t = 10)]
        n: usize,
    },
    /// Delete every queued job
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Completed jobs: the count, plus the first or last N
    Completed {
        #[arg(long, conflicts_with = "last")]
        first: Option<usize>,
        #[arg(long)]
        last: Option<usize>,
    },
    /// Queued jobs that already failed at least one attempt
    Failed {
        #[arg(short = 'n', long, default_value_t = 10)]
        n: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
    /// Delete a group and all of its results
    Delete {
        id: GroupId,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum LlmCommand {
    /// Check that the generation service answers
    Probe,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_export_flags() {
        let cli = Cli::parse_from([
            "dprompts",
            "--log-format",
            "json",
            "export",
            "--format",
            "text",
            "--from-date",
            "2026-01-01",
            "--dry-run",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Export(args) => {
                assert_eq!(args.format, ExportFormat::Text);
                assert_eq!(args.from_date.as_deref(), Some("2026-01-01"));
                assert!(args.dry_run);
                assert!(!args.full_export);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn enqueue_needs_exactly_one_source() {
        assert!(Cli::try_parse_from(["dprompts", "enqueue"]).is_err());
        assert!(
            Cli::try_parse_from([
                "dprompts",
                "enqueue",
                "--args",
                "{}",
                "--bulk-from-file",
                "jobs.json"
            ])
            .is_err()
        );
        assert!(Cli::try_parse_from(["dprompts", "enqueue", "--bulk-from-file", "jobs.json"]).is_ok());
    }

    #[test]
    fn group_ids_are_parsed() {
        let cli = Cli::parse_from(["dprompts", "group", "delete", "42", "--yes"]);
        match cli.command {
            Command::Group(GroupCommand::Delete { id, yes }) => {
                assert_eq!(id, GroupId::new(42));
                assert!(yes);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
