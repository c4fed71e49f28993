use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};

use crate::pipeline::subject::SubjectKind;

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "nomos",
    version,
    author,
    about = "Legislative batch-analysis pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Process the analysis backlog until empty.
    Run(RunArgs),
    /// Inspect and repair the job queue.
    Jobs(JobsArgs),
}

/// Which subject backlogs to process.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindFilter {
    Bills,
    Clusters,
    All,
}

impl KindFilter {
    pub fn kinds(self) -> Vec<SubjectKind> {
        match self {
            KindFilter::Bills => vec![SubjectKind::Bill],
            KindFilter::Clusters => vec![SubjectKind::Cluster],
            KindFilter::All => vec![SubjectKind::Bill, SubjectKind::Cluster],
        }
    }
}

/// Options for the `run` command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Process one batch inside a rolled-back transaction and log the
    /// would-be writes instead of committing them.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
    /// Subject backlog(s) to process.
    #[arg(long, value_enum, default_value_t = KindFilter::All)]
    pub kind: KindFilter,
    /// Cap jobs per claim below the token-budget estimate.
    #[arg(long)]
    pub limit: Option<usize>,
    /// Claim in random order to spread load across parallel workers.
    #[arg(long, action = ArgAction::SetTrue)]
    pub random_order: bool,
}

/// Job queue management command namespace.
#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommands,
}

/// Supported job subcommands.
#[derive(Debug, Subcommand)]
pub enum JobsCommands {
    /// Display job counts per status.
    Status,
    /// Return jobs stuck in `processing` to `pending`.
    Reset,
}
