use std::path::PathBuf;

use anyhow::Result;
use apply_recommendations::config::Config;
use apply_recommendations::coordinator::{Allocation, RunOutcome};
use apply_recommendations::run::{format_ts, Run, RunStatus, TriggerKind};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "apply-recommendations",
    about = "Trigger and window coordinator for recommendation evaluation runs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override storage.db_path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service (timer and/or HTTP trigger)
    Serve,

    /// Recover, then request a single run and exit
    RunOnce,

    /// Show recorded runs, newest first
    History {
        /// Number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Preview the window the next run would cover
    NextWindow,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        cfg.storage.db_path = db;
    }
    apply_recommendations::init_tracing(&cfg.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!(method = ?cfg.trigger.method, "starting apply-recommendations");
            apply_recommendations::serve(cfg).await?;
        }
        Commands::RunOnce => {
            let coordinator = apply_recommendations::build_coordinator(&cfg)?;
            apply_recommendations::prepare(&cfg, &coordinator).await?;
            match coordinator.request_run(TriggerKind::Request).await? {
                RunOutcome::Completed(run) => {
                    print_run(&run);
                    if run.status == RunStatus::Failed {
                        anyhow::bail!("run {} failed", run.id);
                    }
                }
                RunOutcome::NoOp(reason) => {
                    println!("No run needed: {}", serde_json::to_string(&reason)?);
                }
                RunOutcome::Rejected => println!("Another run is in progress."),
            }
        }
        Commands::History { limit, json } => {
            let ledger = apply_recommendations::open_ledger(&cfg)?;
            let runs = ledger.list(limit.max(1))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                println!(
                    "{:<6} | {:<10} | {:<8} | {:<27} | {:<27} | Detail",
                    "ID", "Status", "Trigger", "Window start", "Window end"
                );
                println!("{:-<6}-|-{:-<10}-|-{:-<8}-|-{:-<27}-|-{:-<27}-|-{:-<20}", "", "", "", "", "", "");
                for run in &runs {
                    println!(
                        "{:<6} | {:<10} | {:<8} | {:<27} | {:<27} | {}",
                        run.id,
                        run.status,
                        run.trigger_kind,
                        format_ts(run.window.start),
                        format_ts(run.window.end),
                        run.failure_reason.as_deref().or(run.summary.as_deref()).unwrap_or("")
                    );
                }
            }
        }
        Commands::NextWindow => {
            let ledger = apply_recommendations::open_ledger(&cfg)?;
            let allocator = apply_recommendations::build_allocator(&cfg, ledger);
            let now = chrono::Utc::now();
            match allocator.allocate(now)? {
                Allocation::Fresh { window } => println!("Next window: {window}"),
                Allocation::Retry { window, failed_run_id } => {
                    println!("Next window: {window} (retry of failed run {failed_run_id})")
                }
                Allocation::TooSoon { frontier } => println!(
                    "Too soon: covered up to {}, minimum window is {}s",
                    format_ts(frontier),
                    allocator.min_window().num_seconds()
                ),
                Allocation::ClockRegression { frontier, now } => println!(
                    "Clock regression: now {} is before covered frontier {}",
                    format_ts(now),
                    format_ts(frontier)
                ),
            }
        }
    }

    Ok(())
}

fn print_run(run: &Run) {
    println!("Run {}: {} {}", run.id, run.status, run.window);
    if let Some(reason) = &run.failure_reason {
        println!("  reason:  {reason}");
    }
    if let Some(summary) = &run.summary {
        println!("  summary: {summary}");
    }
}
