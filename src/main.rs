//! wafer_cell CLI: run the simulated cell end to end.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use wafer_cell::config::CellConfig;
use wafer_cell::logging::init_tracing;
use wafer_cell::scheduler::Strategy;
use wafer_cell::sim::{DemoSummary, run_demo};

/// Wafer cell transfer scheduler
#[derive(Parser)]
#[command(name = "wafer_cell")]
#[command(about = "Simulated wafer cell with interchangeable transfer schedulers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run batches through the standard cell and print a summary
    Demo {
        /// Scheduler strategy (lock, mailbox, agents)
        #[arg(short, long)]
        strategy: Option<Strategy>,

        /// Number of batches
        #[arg(short, long, default_value = "2")]
        batches: usize,

        /// Wafers per batch
        #[arg(short, long, default_value = "5")]
        wafers: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the same workload under every strategy and compare outcomes
    Compare {
        /// Number of batches
        #[arg(short, long, default_value = "1")]
        batches: usize,

        /// Wafers per batch
        #[arg(short, long, default_value = "5")]
        wafers: usize,
    },
}

fn print_summary(summary: &DemoSummary) {
    println!("DEMO SUMMARY");
    println!("strategy={}", summary.strategy);
    println!(
        "batches_completed={}/{}",
        summary.batches_completed, summary.batches_requested
    );
    println!("wafers_per_batch={}", summary.wafers_per_batch);
    println!("transfers={}", summary.transfers);
    println!("elapsed_ms={}", summary.elapsed_ms);
    println!("final_queue_depth={}", summary.final_queue_depth);
    println!("max_active_robots={}", summary.audit.max_active_robots);
    println!("max_stalled_requests={}", summary.max_stalled_requests);
    println!(
        "mutual_exclusion_violation={}",
        summary.mutual_exclusion_violation
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CellConfig::from_env().context("invalid WAFER_CELL_* configuration")?;
    init_tracing(config.log_format).context("failed to install tracing subscriber")?;

    let command = cli.command.unwrap_or(Commands::Demo {
        strategy: None,
        batches: 2,
        wafers: 5,
        json: false,
    });
    match command {
        Commands::Demo {
            strategy,
            batches,
            wafers,
            json,
        } => {
            if let Some(strategy) = strategy {
                config.strategy = strategy;
            }
            let summary = run_demo(&config, batches, wafers)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if summary.batches_completed != summary.batches_requested {
                bail!(
                    "only {} of {} batches completed",
                    summary.batches_completed,
                    summary.batches_requested
                );
            }
        }
        Commands::Compare { batches, wafers } => {
            let mut outcomes = Vec::new();
            for strategy in Strategy::ALL {
                config.strategy = strategy;
                let summary = run_demo(&config, batches, wafers)
                    .with_context(|| format!("{strategy} run failed"))?;
                info!(%strategy, elapsed_ms = summary.elapsed_ms, "strategy finished");
                println!(
                    "strategy={} batches_completed={} transfers={} elapsed_ms={} violation={}",
                    strategy,
                    summary.batches_completed,
                    summary.transfers,
                    summary.elapsed_ms,
                    summary.mutual_exclusion_violation
                );
                outcomes.push(summary);
            }
            let consistent = outcomes.windows(2).all(|pair| {
                pair[0].batches_completed == pair[1].batches_completed
                    && pair[0].transfers == pair[1].transfers
            });
            println!("strategies_agree={consistent}");
            if !consistent {
                bail!("strategies disagree on the outcome of the same workload");
            }
        }
    }
    Ok(())
}
