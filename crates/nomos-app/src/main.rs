use std::process;

use tracing_subscriber::{filter::LevelFilter, fmt};

use nomos_app::cli::{Cli, Commands, JobsCommands};
use nomos_app::config;
use nomos_app::error::AppError;
use nomos_app::services::{jobs_reset, jobs_status, run_backlog, run_dry_run};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Run(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        Some(Commands::Jobs(_)) => match cli.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        None => match cli.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Run(args)) => {
            let cfg = config::load()?;
            let kinds = args.kind.kinds();
            let summary = if args.dry_run {
                run_dry_run(&cfg, &kinds, args.limit).await?
            } else {
                run_backlog(&cfg, &kinds, args.limit, args.random_order).await?
            };
            if summary.claimed == 0 {
                println!("nothing to do");
            } else {
                println!(
                    "claimed {} job(s) across {} batch(es): {} completed, {} no_theme, {} requeued, {} failed{}",
                    summary.claimed,
                    summary.batches,
                    summary.stats.completed,
                    summary.stats.no_theme,
                    summary.stats.requeued,
                    summary.stats.failed,
                    if args.dry_run {
                        " (dry run, rolled back)"
                    } else {
                        ""
                    }
                );
            }
        }
        Some(Commands::Jobs(args)) => match args.command {
            JobsCommands::Status => {
                let cfg = config::load()?;
                let counts = jobs_status(&cfg).await?;
                println!("status\tcount\toldest_created_at");
                if counts.is_empty() {
                    println!("(no jobs)");
                }
                for row in counts {
                    let oldest = row
                        .oldest_created_at
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{}\t{}\t{}", row.status, row.jobs, oldest);
                }
            }
            JobsCommands::Reset => {
                let cfg = config::load()?;
                let reset = jobs_reset(&cfg).await?;
                println!("reset {reset} job(s) from processing back to pending");
            }
        },
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}
