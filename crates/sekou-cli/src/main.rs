use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sekou_core::CompositeKey;
use sekou_sync::{init_logging, PassSummary, SyncConfig, SyncService};

#[derive(Debug, Parser)]
#[command(name = "sekou-cli")]
#[command(about = "Construction schedule sync between the source database and the remote record store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP trigger and manual resync pages (default).
    ///
    /// With SCHEDULER_ENABLED set, today's pass also runs on SYNC_CRON, a
    /// six-field cron expression with seconds first (default "0 */15 * * * *").
    Serve,
    /// Run today's pass once, skipped when replication is idle.
    Sync,
    /// Resync a single (project, round).
    Patch {
        #[arg(long)]
        project_no: i64,
        #[arg(long)]
        round_no: i32,
    },
    /// Resync every pair modified on the given days, inclusive.
    Recover {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Merge daily reports from the remote store into the source tables.
    Reverse,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;
    init_logging(config.log_format);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => sekou_web::serve(config).await?,
        Commands::Sync => {
            let service = SyncService::from_config(&config)?;
            print_summary(&service.run_today().await?);
        }
        Commands::Patch {
            project_no,
            round_no,
        } => {
            let service = SyncService::from_config(&config)?;
            let key = CompositeKey::new(project_no, round_no);
            let summary = service.run_single(key).await?;
            if summary.extracted == 0 {
                anyhow::bail!("no schedulable source record for {key}");
            }
            print_summary(&summary);
        }
        Commands::Recover { from, to } => {
            if from > to {
                anyhow::bail!("--from {from} is after --to {to}");
            }
            let service = SyncService::from_config(&config)?;
            print_summary(&service.run_range(from, to).await?);
        }
        Commands::Reverse => {
            let service = SyncService::from_config(&config)?;
            let summary = service.run_reverse().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn print_summary(summary: &PassSummary) {
    if summary.skipped {
        println!("pass skipped: run_id={} scope={}", summary.run_id, summary.scope);
        return;
    }
    println!(
        "pass complete: run_id={} scope={} extracted={} created={} updated={} failed={}",
        summary.run_id,
        summary.scope,
        summary.extracted,
        summary.created,
        summary.updated,
        summary.failed.len()
    );
    for failure in &summary.failed {
        eprintln!("  failed {}: {}", failure.key, failure.reason);
    }
}
